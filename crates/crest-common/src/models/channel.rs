//! Channel domain models.
//!
//! Channels come in two kinds: `realtime` (live media rooms, credentialed
//! through the media token minter) and `signal` (asynchronous ciphertext
//! messaging fan-out). The kind decides which role scope applies to
//! per-channel role assignments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Realtime,
    Signal,
}

impl ChannelKind {
    /// The role scope matching this channel kind.
    pub fn role_scope(&self) -> crate::permissions::RoleScope {
        match self {
            ChannelKind::Realtime => crate::permissions::RoleScope::RealtimeChannel,
            ChannelKind::Signal => crate::permissions::RoleScope::SignalChannel,
        }
    }
}

/// A channel row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub kind: ChannelKind,
    pub private: bool,
    pub owner_user_id: Uuid,
    /// Role granted to joiners when set
    pub default_role_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Channel membership row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelMember {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub permission_level: i64,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateChannelRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub private: bool,
    pub default_role_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub permission_level: i64,
}
