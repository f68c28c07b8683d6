//! Channel repository.

use anyhow::Result;
use chrono::Utc;
use crest_common::models::channel::{Channel, ChannelKind, ChannelMember};
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn create(
    pool: &SqlitePool,
    name: &str,
    kind: ChannelKind,
    private: bool,
    owner_user_id: Uuid,
    default_role_id: Option<Uuid>,
) -> Result<Channel> {
    let row = sqlx::query_as::<_, Channel>(
        r#"
        INSERT INTO channels (id, name, kind, private, owner_user_id, default_role_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(kind)
    .bind(private)
    .bind(owner_user_id)
    .bind(default_role_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn find(pool: &SqlitePool, channel_id: Uuid) -> Result<Option<Channel>> {
    let row = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = ?")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Channels the user can see: public ones plus those they own or joined.
pub async fn list_visible(pool: &SqlitePool, user_id: Uuid) -> Result<Vec<Channel>> {
    let rows = sqlx::query_as::<_, Channel>(
        r#"
        SELECT DISTINCT c.* FROM channels c
        LEFT JOIN channel_members m ON m.channel_id = c.id AND m.user_id = ?
        WHERE c.private = 0 OR c.owner_user_id = ? OR m.user_id IS NOT NULL
        ORDER BY c.created_at ASC
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn delete(pool: &SqlitePool, channel_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM channels WHERE id = ?")
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn add_member(
    pool: &SqlitePool,
    channel_id: Uuid,
    user_id: Uuid,
    permission_level: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO channel_members (channel_id, user_id, permission_level, joined_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (channel_id, user_id) DO NOTHING
        "#,
    )
    .bind(channel_id)
    .bind(user_id)
    .bind(permission_level)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_member(pool: &SqlitePool, channel_id: Uuid, user_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?")
        .bind(channel_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_members(pool: &SqlitePool, channel_id: Uuid) -> Result<Vec<ChannelMember>> {
    let rows = sqlx::query_as::<_, ChannelMember>(
        "SELECT * FROM channel_members WHERE channel_id = ? ORDER BY joined_at ASC",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Whether `user_id` is the owner or a member of the channel.
pub async fn is_owner_or_member(
    pool: &SqlitePool,
    channel_id: Uuid,
    user_id: Uuid,
) -> Result<bool> {
    let found: i64 = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM channels WHERE id = ? AND owner_user_id = ?
            UNION
            SELECT 1 FROM channel_members WHERE channel_id = ? AND user_id = ?
        )
        "#,
    )
    .bind(channel_id)
    .bind(user_id)
    .bind(channel_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(found != 0)
}

/// Distinct recipient set for group fan-out: owner plus members.
pub async fn recipient_user_ids(pool: &SqlitePool, channel_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT owner_user_id AS user_id FROM channels WHERE id = ?
        UNION
        SELECT user_id FROM channel_members WHERE channel_id = ?
        "#,
    )
    .bind(channel_id)
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
