//! Role domain models.
//!
//! Roles are flat: a scope plus a set of opaque permission strings. Builtin
//! roles are seeded at first start and can be assigned but never edited or
//! deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;
use validator::Validate;

use crate::permissions::RoleScope;

/// A role row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub scope: RoleScope,
    pub permissions: Json<Vec<String>>,
    pub builtin: bool,
    pub created_at: DateTime<Utc>,
}

/// Server-scope role assignment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRoleServer {
    pub user_id: Uuid,
    pub role_id: Uuid,
}

/// Channel-scope role assignment; the role's scope must match the channel kind.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRoleChannel {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub channel_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(max = 256))]
    pub description: Option<String>,
    pub scope: RoleScope,
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateRoleRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    #[validate(length(max = 256))]
    pub description: Option<String>,
    pub permissions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub user_id: Uuid,
    pub role_id: Uuid,
    /// Present for channel-scope assignment, absent for server scope
    pub channel_id: Option<Uuid>,
}
