//! Permission vocabulary and effective-permission algebra.
//!
//! Permissions are opaque strings as far as the core is concerned; roles carry
//! a set of them and resolution is a union across assignments. Two scopes
//! exist: server-wide and per-channel, with channel roles split by channel
//! kind. Channel owners get a fixed set of implicit grants inside their own
//! channel regardless of role assignments.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Well-known permission strings. The core never interprets these beyond
/// equality; routes pick the one they gate on.
pub mod perm {
    pub const CHANNEL_CREATE: &str = "channel.create";
    pub const CHANNEL_MANAGE: &str = "channel.manage";
    pub const USER_ADD: &str = "user.add";
    pub const USER_KICK: &str = "user.kick";
    pub const ROLE_CREATE: &str = "role.create";
    pub const ROLE_EDIT: &str = "role.edit";
    pub const ROLE_DELETE: &str = "role.delete";
    pub const ROLE_ASSIGN: &str = "role.assign";
    pub const MEMBER_VIEW: &str = "member.view";
    pub const SERVER_MANAGE: &str = "server.manage";
}

/// Scope a role can be assigned in. Channel-scoped roles must match the
/// kind of the channel they are assigned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoleScope {
    Server,
    RealtimeChannel,
    SignalChannel,
}

/// Resolution scope for a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionScope {
    Server,
    Channel(uuid::Uuid),
}

/// Grants a channel owner always holds inside their own channel.
pub fn owner_implicit_grants() -> &'static [&'static str] {
    &[
        perm::CHANNEL_MANAGE,
        perm::MEMBER_VIEW,
        perm::USER_ADD,
        perm::USER_KICK,
    ]
}

/// Union of permission strings resolved for one user at one scope.
#[derive(Debug, Clone, Default)]
pub struct EffectivePermissions {
    grants: HashSet<String>,
}

impl EffectivePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one role's permission list into the set.
    pub fn extend_from_role(&mut self, permissions: &[String]) {
        self.grants.extend(permissions.iter().cloned());
    }

    /// Apply the owner-implicit grants.
    pub fn grant_owner_implicits(&mut self) {
        self.grants
            .extend(owner_implicit_grants().iter().map(|p| p.to_string()));
    }

    pub fn has(&self, permission: &str) -> bool {
        self.grants.contains(permission)
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn into_sorted_vec(self) -> Vec<String> {
        let mut v: Vec<String> = self.grants.into_iter().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_across_roles() {
        let mut eff = EffectivePermissions::new();
        eff.extend_from_role(&[perm::MEMBER_VIEW.to_string()]);
        eff.extend_from_role(&[perm::USER_ADD.to_string(), perm::MEMBER_VIEW.to_string()]);
        assert!(eff.has(perm::MEMBER_VIEW));
        assert!(eff.has(perm::USER_ADD));
        assert!(!eff.has(perm::SERVER_MANAGE));
    }

    #[test]
    fn owner_always_manages_channel() {
        let mut eff = EffectivePermissions::new();
        eff.grant_owner_implicits();
        assert!(eff.has(perm::CHANNEL_MANAGE));
    }
}
