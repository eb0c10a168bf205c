//! Cache invalidation: which cached queries an incoming envelope makes stale.
//!
//! The rules are declared once in [`INVALIDATION_TABLE`] plus two refinements that need
//! envelope data (`notification-read` related entity, `chat-message` peer).

use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, warn};

use crate::models::{EntityId, Envelope, EnvelopeType, RelatedEntityType, UserId, TEAM_RECEIVER_ID};

/// Identifier of a cached query result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    Notifications,
    Activities,
    Deals,
    Performance,
    TeamMessages,
    /// Every direct conversation (prefix key).
    Conversations,
    /// Direct conversation with the given peer.
    Conversation(UserId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Notifications => f.write_str("/api/notifications"),
            CacheKey::Activities => f.write_str("/api/activities"),
            CacheKey::Deals => f.write_str("/api/deals"),
            CacheKey::Performance => f.write_str("/api/performance"),
            CacheKey::TeamMessages => f.write_str("/api/messages/team"),
            CacheKey::Conversations => f.write_str("/api/messages"),
            CacheKey::Conversation(peer) => write!(f, "/api/messages/{}", peer),
        }
    }
}

/// Static part of the mapping, keyed by envelope type.
pub const INVALIDATION_TABLE: &[(EnvelopeType, &[CacheKey])] = &[
    (EnvelopeType::Notification, &[CacheKey::Notifications]),
    (EnvelopeType::NotificationRead, &[CacheKey::Notifications]),
    (
        EnvelopeType::ActivityChanged,
        &[CacheKey::Activities, CacheKey::Performance],
    ),
    (
        EnvelopeType::DealChanged,
        &[CacheKey::Deals, CacheKey::Performance],
    ),
];

/// Refreshed when the server answers `init`; events may have been missed while offline.
pub const RECONCILE_KEYS: &[CacheKey] = &[
    CacheKey::Notifications,
    CacheKey::Activities,
    CacheKey::Deals,
    CacheKey::Performance,
    CacheKey::TeamMessages,
    CacheKey::Conversations,
];

/// The cached query layer. Owns refetching; the mapper only marks keys stale.
pub trait QueryCache: Send + Sync {
    fn invalidate(&self, key: &CacheKey);
}

/// Keys awaiting refetch. Marking is a set union, so repeats are harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInvalidations {
    keys: BTreeSet<CacheKey>,
}

impl PendingInvalidations {
    pub fn mark(&mut self, key: CacheKey) -> bool {
        self.keys.insert(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Hand every pending key to `cache` and clear the set.
    pub fn flush(&mut self, cache: &dyn QueryCache) -> usize {
        let keys = std::mem::take(&mut self.keys);
        for key in &keys {
            cache.invalidate(key);
        }
        keys.len()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessagePayload {
    sender_id: UserId,
    receiver_id: UserId,
}

/// Maps envelopes to cache keys for one client identity.
#[derive(Debug, Clone)]
pub struct InvalidationMapper {
    self_id: UserId,
    suppress_echoes: bool,
    optimistic: HashSet<(EnvelopeType, Option<EntityId>)>,
}

impl InvalidationMapper {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            suppress_echoes: false,
            optimistic: HashSet::new(),
        }
    }

    /// Skip echoes of mutations recorded via [`Self::record_optimistic`].
    pub fn with_echo_suppression(mut self, enabled: bool) -> Self {
        self.suppress_echoes = enabled;
        self
    }

    /// Remember that a local mutation already updated the cache for this envelope.
    ///
    /// `entity_id` is the notification id for `notification-read` (the echo carries it in
    /// `payload.id`) and the related entity id for every other type.
    pub fn record_optimistic(&mut self, kind: EnvelopeType, entity_id: Option<EntityId>) {
        if self.suppress_echoes {
            self.optimistic.insert((kind, entity_id));
        }
    }

    /// Keys an envelope invalidates. Pure lookup, no echo handling.
    pub fn keys_for(&self, envelope: &Envelope) -> BTreeSet<CacheKey> {
        let mut keys: BTreeSet<CacheKey> = INVALIDATION_TABLE
            .iter()
            .filter(|(kind, _)| *kind == envelope.kind)
            .flat_map(|(_, keys)| keys.iter().copied())
            .collect();

        match envelope.kind {
            EnvelopeType::NotificationRead => match envelope.related_entity_type {
                Some(RelatedEntityType::Activity) => {
                    keys.insert(CacheKey::Activities);
                }
                Some(RelatedEntityType::Deal) => {
                    keys.insert(CacheKey::Deals);
                }
                _ => {}
            },
            EnvelopeType::ChatMessage => {
                if let Some(key) = self.conversation_key(envelope) {
                    keys.insert(key);
                }
            }
            _ => {}
        }
        keys
    }

    /// Mark everything `envelope` invalidates. Returns the number of newly pending keys.
    pub fn apply(&mut self, envelope: &Envelope, pending: &mut PendingInvalidations) -> usize {
        if self.is_own_echo(envelope) {
            debug!(kind = ?envelope.kind, "skipping echo of optimistic update");
            return 0;
        }
        self.keys_for(envelope)
            .into_iter()
            .filter(|key| pending.mark(*key))
            .count()
    }

    /// Mark every collection stale after a (re)connect handshake.
    pub fn reconcile(&self, pending: &mut PendingInvalidations) -> usize {
        RECONCILE_KEYS.iter().filter(|key| pending.mark(**key)).count()
    }

    fn is_own_echo(&mut self, envelope: &Envelope) -> bool {
        self.suppress_echoes
            && envelope.origin_user_id == Some(self.self_id)
            && self.optimistic.remove(&echo_key(envelope))
    }

    fn conversation_key(&self, envelope: &Envelope) -> Option<CacheKey> {
        let payload: ChatMessagePayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "chat-message without sender/receiver ids");
                return None;
            }
        };
        if payload.receiver_id == TEAM_RECEIVER_ID {
            return Some(CacheKey::TeamMessages);
        }
        let peer = if payload.sender_id == self.self_id {
            payload.receiver_id
        } else {
            payload.sender_id
        };
        Some(CacheKey::Conversation(peer))
    }
}

/// The `(kind, entity)` pair an echo is matched on.
fn echo_key(envelope: &Envelope) -> (EnvelopeType, Option<EntityId>) {
    match envelope.kind {
        EnvelopeType::NotificationRead => (
            envelope.kind,
            envelope.payload.get("id").and_then(serde_json::Value::as_i64),
        ),
        kind => (kind, envelope.related_entity_id),
    }
}
