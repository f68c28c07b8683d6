//! Role repository — role rows plus the two assignment tables.

use anyhow::Result;
use chrono::Utc;
use crest_common::models::role::Role;
use crest_common::permissions::{RoleScope, perm};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

pub async fn create(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    scope: RoleScope,
    permissions: &[String],
    builtin: bool,
) -> Result<Role> {
    let row = sqlx::query_as::<_, Role>(
        r#"
        INSERT INTO roles (id, name, description, scope, permissions, builtin, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(description)
    .bind(scope)
    .bind(Json(permissions))
    .bind(builtin)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn find(pool: &SqlitePool, role_id: Uuid) -> Result<Option<Role>> {
    let row = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = ?")
        .bind(role_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn find_by_name(
    pool: &SqlitePool,
    name: &str,
    scope: RoleScope,
) -> Result<Option<Role>> {
    let row = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE name = ? AND scope = ?")
        .bind(name)
        .bind(scope)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Role>> {
    let rows = sqlx::query_as::<_, Role>("SELECT * FROM roles ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Update name / description / permissions; `None` leaves a field as-is.
/// Builtin protection is enforced by the caller before submission.
pub async fn update(
    pool: &SqlitePool,
    role_id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    permissions: Option<&[String]>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE roles SET
            name        = COALESCE(?, name),
            description = COALESCE(?, description),
            permissions = COALESCE(?, permissions)
        WHERE id = ?
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(permissions.map(Json))
    .bind(role_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, role_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM roles WHERE id = ?")
        .bind(role_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn assign_server(pool: &SqlitePool, user_id: Uuid, role_id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_roles_server (user_id, role_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(user_id)
    .bind(role_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn assign_channel(
    pool: &SqlitePool,
    user_id: Uuid,
    role_id: Uuid,
    channel_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_roles_channel (user_id, role_id, channel_id)
        VALUES (?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(role_id)
    .bind(channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn unassign_server(pool: &SqlitePool, user_id: Uuid, role_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM user_roles_server WHERE user_id = ? AND role_id = ?")
        .bind(user_id)
        .bind(role_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn unassign_channel(
    pool: &SqlitePool,
    user_id: Uuid,
    role_id: Uuid,
    channel_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM user_roles_channel WHERE user_id = ? AND role_id = ? AND channel_id = ?",
    )
    .bind(user_id)
    .bind(role_id)
    .bind(channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Roles assigned to a user at server scope.
pub async fn server_roles_for(pool: &SqlitePool, user_id: Uuid) -> Result<Vec<Role>> {
    let rows = sqlx::query_as::<_, Role>(
        r#"
        SELECT r.* FROM roles r
        JOIN user_roles_server a ON a.role_id = r.id
        WHERE a.user_id = ?
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Roles assigned to a user within one channel.
pub async fn channel_roles_for(
    pool: &SqlitePool,
    user_id: Uuid,
    channel_id: Uuid,
) -> Result<Vec<Role>> {
    let rows = sqlx::query_as::<_, Role>(
        r#"
        SELECT r.* FROM roles r
        JOIN user_roles_channel a ON a.role_id = r.id
        WHERE a.user_id = ? AND a.channel_id = ?
        "#,
    )
    .bind(user_id)
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Seed the builtin roles on first start. Idempotent.
pub async fn seed_builtins(pool: &SqlitePool) -> Result<()> {
    let builtins: &[(&str, RoleScope, &[&str])] = &[
        (
            "admin",
            RoleScope::Server,
            &[
                perm::SERVER_MANAGE,
                perm::CHANNEL_CREATE,
                perm::CHANNEL_MANAGE,
                perm::USER_ADD,
                perm::USER_KICK,
                perm::ROLE_CREATE,
                perm::ROLE_EDIT,
                perm::ROLE_DELETE,
                perm::ROLE_ASSIGN,
                perm::MEMBER_VIEW,
            ],
        ),
        ("member", RoleScope::Server, &[perm::CHANNEL_CREATE, perm::MEMBER_VIEW]),
        (
            "moderator",
            RoleScope::SignalChannel,
            &[perm::CHANNEL_MANAGE, perm::USER_ADD, perm::USER_KICK, perm::MEMBER_VIEW],
        ),
        (
            "host",
            RoleScope::RealtimeChannel,
            &[perm::CHANNEL_MANAGE, perm::USER_ADD, perm::USER_KICK, perm::MEMBER_VIEW],
        ),
    ];

    for (name, scope, perms) in builtins {
        if find_by_name(pool, name, *scope).await?.is_none() {
            let perms: Vec<String> = perms.iter().map(|p| p.to_string()).collect();
            create(pool, name, None, *scope, &perms, true).await?;
        }
    }
    Ok(())
}
