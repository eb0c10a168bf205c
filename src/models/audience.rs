//! Dispatch audiences and user roles.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::envelope::UserId;

/// Role held by a user in the external directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Director,
    Manager,
    Broker,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "director" => Ok(Role::Director),
            "manager" => Ok(Role::Manager),
            "broker" => Ok(Role::Broker),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Rule deciding which connections receive an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Audience {
    /// Every connection of one user.
    SingleUser {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// Every connection whose user currently holds the role (resolved per dispatch).
    RoleScope { role: Role },
    /// Every open connection.
    BroadcastAll,
}

impl Audience {
    pub fn single_user(user_id: UserId) -> Self {
        Audience::SingleUser { user_id }
    }

    pub fn role_scope(role: Role) -> Self {
        Audience::RoleScope { role }
    }
}
