//! The authorization oracle.
//!
//! Effective permissions are the union of role grants at the requested
//! scope, plus owner-implicit grants inside owned channels. A channel-scope
//! check falls back to the caller's server-scope grants, and
//! `server.manage` passes every check.

use crest_common::error::{CrestError, CrestResult};
use crest_common::permissions::{EffectivePermissions, PermissionScope, perm};
use crest_db::Database;
use crest_db::repository::{channels, roles};
use uuid::Uuid;

/// Resolve the effective permissions of `user_id` at one scope.
pub async fn effective_permissions(
    db: &Database,
    user_id: Uuid,
    scope: PermissionScope,
) -> CrestResult<EffectivePermissions> {
    let mut eff = EffectivePermissions::new();
    match scope {
        PermissionScope::Server => {
            for role in roles::server_roles_for(&db.pool, user_id)
                .await
                .map_err(CrestError::Internal)?
            {
                eff.extend_from_role(&role.permissions.0);
            }
        }
        PermissionScope::Channel(channel_id) => {
            for role in roles::channel_roles_for(&db.pool, user_id, channel_id)
                .await
                .map_err(CrestError::Internal)?
            {
                eff.extend_from_role(&role.permissions.0);
            }
            let channel = channels::find(&db.pool, channel_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::ChannelNotFound)?;
            if channel.owner_user_id == user_id {
                eff.grant_owner_implicits();
            }
        }
    }
    Ok(eff)
}

/// `has_permission(u, perm, scope, channel?)` — the oracle routes consult.
pub async fn has_permission(
    db: &Database,
    user_id: Uuid,
    permission: &str,
    scope: PermissionScope,
) -> CrestResult<bool> {
    let eff = effective_permissions(db, user_id, scope).await?;
    if eff.has(permission) {
        return Ok(true);
    }
    // Channel checks fall back to server-wide grants; server.manage is the
    // master key at both scopes.
    let server = match scope {
        PermissionScope::Server => eff,
        PermissionScope::Channel(_) => {
            effective_permissions(db, user_id, PermissionScope::Server).await?
        }
    };
    Ok(server.has(permission) || server.has(perm::SERVER_MANAGE))
}

/// Like [`has_permission`] but failing with `Forbidden`.
pub async fn require_permission(
    db: &Database,
    user_id: Uuid,
    permission: &str,
    scope: PermissionScope,
) -> CrestResult<()> {
    if has_permission(db, user_id, permission, scope).await? {
        Ok(())
    } else {
        Err(CrestError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crest_common::models::channel::ChannelKind;
    use crest_common::permissions::RoleScope;
    use crest_db::repository::users;

    #[tokio::test]
    async fn owner_always_manages_their_channel() {
        let db = Database::connect_in_memory().await.unwrap();
        let owner = users::create_if_absent(&db.pool, "own@example.com").await.unwrap();
        let channel = channels::create(&db.pool, "c", ChannelKind::Signal, false, owner.id, None)
            .await
            .unwrap();

        // No role assignments at all, still allowed.
        assert!(
            has_permission(
                &db,
                owner.id,
                perm::CHANNEL_MANAGE,
                PermissionScope::Channel(channel.id)
            )
            .await
            .unwrap()
        );
    }

    #[tokio::test]
    async fn role_grants_union_and_server_fallback() {
        let db = Database::connect_in_memory().await.unwrap();
        let user = users::create_if_absent(&db.pool, "u@example.com").await.unwrap();
        let other = users::create_if_absent(&db.pool, "o@example.com").await.unwrap();
        let channel = channels::create(&db.pool, "c2", ChannelKind::Signal, false, other.id, None)
            .await
            .unwrap();

        assert!(
            !has_permission(&db, user.id, perm::USER_KICK, PermissionScope::Channel(channel.id))
                .await
                .unwrap()
        );

        let admin = roles::create(
            &db.pool,
            "ops",
            None,
            RoleScope::Server,
            &[perm::SERVER_MANAGE.to_string()],
            false,
        )
        .await
        .unwrap();
        roles::assign_server(&db.pool, user.id, admin.id).await.unwrap();

        // server.manage opens channel-scope checks too.
        assert!(
            has_permission(&db, user.id, perm::USER_KICK, PermissionScope::Channel(channel.id))
                .await
                .unwrap()
        );
    }
}
