//! Refresh-token repository — opaque single-use tokens with rotation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crest_common::models::session::RefreshToken;
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn insert(
    pool: &SqlitePool,
    token: &str,
    client_handle: &str,
    user_id: Uuid,
    rotation_count: i64,
    expires_at: DateTime<Utc>,
) -> Result<RefreshToken> {
    let row = sqlx::query_as::<_, RefreshToken>(
        r#"
        INSERT INTO refresh_tokens
            (token, client_handle, user_id, rotation_count, used_at, created_at, expires_at)
        VALUES (?, ?, ?, ?, NULL, ?, ?)
        RETURNING *
        "#,
    )
    .bind(token)
    .bind(client_handle)
    .bind(user_id)
    .bind(rotation_count)
    .bind(Utc::now())
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn find(pool: &SqlitePool, token: &str) -> Result<Option<RefreshToken>> {
    let row = sqlx::query_as::<_, RefreshToken>("SELECT * FROM refresh_tokens WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn mark_used(pool: &SqlitePool, token: &str) -> Result<()> {
    sqlx::query("UPDATE refresh_tokens SET used_at = ? WHERE token = ?")
        .bind(Utc::now())
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// All token strings in a client handle's chain.
pub async fn list_chain(pool: &SqlitePool, client_handle: &str) -> Result<Vec<String>> {
    let tokens: Vec<String> =
        sqlx::query_scalar("SELECT token FROM refresh_tokens WHERE client_handle = ?")
            .bind(client_handle)
            .fetch_all(pool)
            .await?;
    Ok(tokens)
}

/// Revoke the whole chain for a client handle. Reuse-detection response.
pub async fn delete_chain(pool: &SqlitePool, client_handle: &str) -> Result<u64> {
    let affected = sqlx::query("DELETE FROM refresh_tokens WHERE client_handle = ?")
        .bind(client_handle)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected)
}

pub async fn purge_expired(pool: &SqlitePool) -> Result<u64> {
    let affected = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected)
}
