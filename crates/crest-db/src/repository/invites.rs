//! Invitation repository plus the one-shot consumption set for short-lived
//! signed bearer tokens.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crest_common::models::enroll::Invite;
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn create(
    pool: &SqlitePool,
    id: Uuid,
    address: Option<&str>,
    created_by: Option<Uuid>,
    expires_at: DateTime<Utc>,
) -> Result<Invite> {
    let row = sqlx::query_as::<_, Invite>(
        r#"
        INSERT INTO invites (id, address, created_by, used, created_at, expires_at)
        VALUES (?, ?, ?, 0, ?, ?)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(address)
    .bind(created_by)
    .bind(Utc::now())
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn find(pool: &SqlitePool, id: Uuid) -> Result<Option<Invite>> {
    let row = sqlx::query_as::<_, Invite>("SELECT * FROM invites WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn mark_used(pool: &SqlitePool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE invites SET used = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Read-only check against the consumption set.
pub async fn token_consumed(pool: &SqlitePool, jti: &str) -> Result<bool> {
    let found: i64 = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM consumed_tokens WHERE jti = ?)")
        .bind(jti)
        .fetch_one(pool)
        .await?;
    Ok(found != 0)
}

/// One-shot consumption for a signed bearer token. Returns false when the
/// token id has been consumed before.
pub async fn try_consume_token(pool: &SqlitePool, jti: &str) -> Result<bool> {
    let affected = sqlx::query(
        "INSERT INTO consumed_tokens (jti, consumed_at) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(jti)
    .bind(Utc::now())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected > 0)
}
