//! Wire envelope exchanged over the persistent connection.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// User identity as stored by the external data service.
pub type UserId = i64;

/// Identifier of a domain entity (activity, deal, notification, message).
pub type EntityId = i64;

/// Receiver id used by chat messages addressed to the whole team.
pub const TEAM_RECEIVER_ID: UserId = 0;

/// Envelope tag. Unrecognised tags decode to [`EnvelopeType::Unknown`] and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    Notification,
    NotificationRead,
    ChatMessage,
    ActivityChanged,
    DealChanged,
    Ping,
    Pong,
    Init,
    #[serde(other)]
    Unknown,
}

impl EnvelopeType {
    /// Liveness and handshake frames never reference a cached collection.
    pub fn is_control(&self) -> bool {
        matches!(self, EnvelopeType::Ping | EnvelopeType::Pong | EnvelopeType::Init)
    }
}

/// Which cached collection an envelope affects. Unrecognised names decode to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelatedEntityType {
    Activity,
    Deal,
    Notification,
    Message,
    #[serde(other)]
    Unknown,
}

impl RelatedEntityType {
    /// Parse the free-form `related_type` column used by stored notifications.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "activity" => Some(RelatedEntityType::Activity),
            "deal" => Some(RelatedEntityType::Deal),
            "notification" => Some(RelatedEntityType::Notification),
            "message" => Some(RelatedEntityType::Message),
            _ => None,
        }
    }
}

/// A single structured frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_entity_type: Option<RelatedEntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<UserId>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            related_entity_type: None,
            related_entity_id: None,
            origin_user_id: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(EnvelopeType::Ping, serde_json::Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(EnvelopeType::Pong, serde_json::Value::Null)
    }

    /// Client request for the state it should reconcile against after (re)connecting.
    pub fn init_request() -> Self {
        Self::new(EnvelopeType::Init, serde_json::Value::Null)
    }

    pub fn with_related(mut self, entity_type: RelatedEntityType, entity_id: EntityId) -> Self {
        self.related_entity_type = Some(entity_type);
        self.related_entity_id = Some(entity_id);
        self
    }

    pub fn with_origin(mut self, user_id: UserId) -> Self {
        self.origin_user_id = Some(user_id);
        self
    }

    /// Decode and validate one text frame.
    pub fn parse(text: &str) -> AppResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check structural invariants that serde alone cannot express.
    pub fn validate(&self) -> AppResult<()> {
        match (self.related_entity_type, self.related_entity_id) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(AppError::Validation(
                    "relatedEntityType and relatedEntityId must be set together".to_string(),
                ));
            }
            (Some(_), Some(_)) if self.kind.is_control() => {
                return Err(AppError::Validation(format!(
                    "{:?} envelopes cannot reference an entity",
                    self.kind
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Encode as a single text frame.
    pub fn to_frame(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
