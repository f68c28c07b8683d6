//! Session repository — cookie session rows and HMAC session rows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crest_common::models::session::{CookieSession, FlowState, HmacSession};
use sqlx::SqlitePool;
use uuid::Uuid;

// ============================================================
// Cookie sessions
// ============================================================

pub async fn create_cookie(
    pool: &SqlitePool,
    id: &str,
    expires_at: DateTime<Utc>,
) -> Result<CookieSession> {
    let row = sqlx::query_as::<_, CookieSession>(
        r#"
        INSERT INTO cookie_sessions (id, flow_state, created_at, expires_at)
        VALUES (?, 'anonymous', ?, ?)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn find_cookie(pool: &SqlitePool, id: &str) -> Result<Option<CookieSession>> {
    let row = sqlx::query_as::<_, CookieSession>("SELECT * FROM cookie_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Persist flow progress on a cookie session. Every field is written
/// verbatim; callers pass the full updated state.
#[allow(clippy::too_many_arguments)]
pub async fn update_cookie_flow(
    pool: &SqlitePool,
    id: &str,
    user_id: Option<Uuid>,
    pending_address: Option<&str>,
    flow_state: FlowState,
    client_handle: Option<&str>,
    device_id: Option<i64>,
    csrf_state: Option<&str>,
    pending_invite_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE cookie_sessions SET
            user_id = ?, pending_address = ?, flow_state = ?,
            client_handle = ?, device_id = ?, csrf_state = ?, pending_invite_id = ?
        WHERE id = ?
        "#,
    )
    .bind(user_id)
    .bind(pending_address)
    .bind(flow_state)
    .bind(client_handle)
    .bind(device_id)
    .bind(csrf_state)
    .bind(pending_invite_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a backup-code failure (or reset on success).
pub async fn set_cookie_backup_failures(
    pool: &SqlitePool,
    id: &str,
    failures: i64,
    last_failure_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE cookie_sessions SET backup_failures = ?, last_backup_failure_at = ? WHERE id = ?",
    )
    .bind(failures)
    .bind(last_failure_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn extend_cookie(
    pool: &SqlitePool,
    id: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE cookie_sessions SET expires_at = ? WHERE id = ?")
        .bind(expires_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_cookie(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM cookie_sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Sweep expired cookie sessions. Idempotent housekeeping.
pub async fn purge_expired_cookies(pool: &SqlitePool) -> Result<u64> {
    let affected = sqlx::query("DELETE FROM cookie_sessions WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected)
}

// ============================================================
// HMAC sessions
// ============================================================

/// Mint (or replace) the HMAC session for a client handle.
pub async fn upsert_hmac(
    pool: &SqlitePool,
    client_handle: &str,
    user_id: Uuid,
    device_id: i64,
    secret: &str,
    device_info: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<HmacSession> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, HmacSession>(
        r#"
        INSERT INTO hmac_sessions
            (client_handle, user_id, device_id, secret, device_info,
             created_at, last_used, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (client_handle) DO UPDATE SET
            user_id = excluded.user_id,
            device_id = excluded.device_id,
            secret = excluded.secret,
            device_info = excluded.device_info,
            last_used = excluded.last_used,
            expires_at = excluded.expires_at
        RETURNING *
        "#,
    )
    .bind(client_handle)
    .bind(user_id)
    .bind(device_id)
    .bind(secret)
    .bind(device_info)
    .bind(now)
    .bind(now)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn find_hmac(pool: &SqlitePool, client_handle: &str) -> Result<Option<HmacSession>> {
    let row = sqlx::query_as::<_, HmacSession>(
        "SELECT * FROM hmac_sessions WHERE client_handle = ?",
    )
    .bind(client_handle)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn bump_hmac_last_used(pool: &SqlitePool, client_handle: &str) -> Result<()> {
    sqlx::query("UPDATE hmac_sessions SET last_used = ? WHERE client_handle = ?")
        .bind(Utc::now())
        .bind(client_handle)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn extend_hmac(
    pool: &SqlitePool,
    client_handle: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE hmac_sessions SET expires_at = ? WHERE client_handle = ?")
        .bind(expires_at)
        .bind(client_handle)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_hmac(pool: &SqlitePool, client_handle: &str) -> Result<()> {
    sqlx::query("DELETE FROM hmac_sessions WHERE client_handle = ?")
        .bind(client_handle)
        .execute(pool)
        .await?;
    Ok(())
}
