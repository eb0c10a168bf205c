//! Stored notification as returned by the notification store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{EntityId, RelatedEntityType, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: EntityId,
    /// `message`, `activity`, `deal`, `performance` or `reminder`.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    pub user_id: UserId,
    pub read: bool,
    pub related_id: Option<EntityId>,
    pub related_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// The activity or deal this notification points at, if any.
    pub fn related_collection(&self) -> Option<(RelatedEntityType, EntityId)> {
        let entity_type = self
            .related_type
            .as_deref()
            .and_then(RelatedEntityType::from_name)?;
        match entity_type {
            RelatedEntityType::Activity | RelatedEntityType::Deal => {
                self.related_id.map(|id| (entity_type, id))
            }
            _ => None,
        }
    }
}
