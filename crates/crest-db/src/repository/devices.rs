//! Device repository.
//!
//! Device numbers are per-user, dense, and assigned `max + 1` — callers
//! must run [`create`] inside a serializer closure so two sightings cannot
//! race the assignment. Reclaim of a client handle seen under a different
//! account deletes the old device row; pre-keys and sessions keyed by it go
//! via cascade.

use anyhow::Result;
use chrono::Utc;
use crest_common::models::device::Device;
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn find(pool: &SqlitePool, user_id: Uuid, device_id: i64) -> Result<Option<Device>> {
    let row = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE user_id = ? AND device_id = ?",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Find by client handle, whoever owns it.
pub async fn find_by_handle(pool: &SqlitePool, client_handle: &str) -> Result<Option<Device>> {
    let row = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE client_handle = ?")
        .bind(client_handle)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_for_user(pool: &SqlitePool, user_id: Uuid) -> Result<Vec<Device>> {
    let rows = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE user_id = ? ORDER BY device_id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Create a device for `user_id` with the next dense device number.
/// Serializer-closure only.
pub async fn create(
    pool: &SqlitePool,
    user_id: Uuid,
    client_handle: &str,
    ip: Option<&str>,
    user_agent: Option<&str>,
    location: Option<&str>,
) -> Result<Device> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, Device>(
        r#"
        INSERT INTO devices (user_id, device_id, client_handle, ip, user_agent, location,
                             created_at, last_seen_at)
        VALUES (
            ?,
            COALESCE((SELECT MAX(device_id) + 1 FROM devices WHERE user_id = ?), 1),
            ?, ?, ?, ?, ?, ?
        )
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .bind(client_handle)
    .bind(ip)
    .bind(user_agent)
    .bind(location)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Refresh sighting metadata. Best-effort fields stay as-is when `None`.
pub async fn touch(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
    ip: Option<&str>,
    user_agent: Option<&str>,
    location: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE devices SET
            ip           = COALESCE(?, ip),
            user_agent   = COALESCE(?, user_agent),
            location     = COALESCE(?, location),
            last_seen_at = ?
        WHERE user_id = ? AND device_id = ?
        "#,
    )
    .bind(ip)
    .bind(user_agent)
    .bind(location)
    .bind(Utc::now())
    .bind(user_id)
    .bind(device_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a device. Pre-keys, HMAC sessions, and inbox envelopes cascade;
/// refresh tokens are keyed by handle and cleared explicitly.
pub async fn delete(pool: &SqlitePool, user_id: Uuid, device_id: i64) -> Result<()> {
    let handle: Option<String> = sqlx::query_scalar(
        "SELECT client_handle FROM devices WHERE user_id = ? AND device_id = ?",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    if let Some(handle) = handle {
        sqlx::query("DELETE FROM refresh_tokens WHERE client_handle = ?")
            .bind(&handle)
            .execute(pool)
            .await?;
    }
    sqlx::query("DELETE FROM devices WHERE user_id = ? AND device_id = ?")
        .bind(user_id)
        .bind(device_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reclaim path: destroy the device row holding `client_handle` together
/// with everything keyed by the handle. Serializer-closure only.
pub async fn delete_by_handle(pool: &SqlitePool, client_handle: &str) -> Result<()> {
    sqlx::query("DELETE FROM refresh_tokens WHERE client_handle = ?")
        .bind(client_handle)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM devices WHERE client_handle = ?")
        .bind(client_handle)
        .execute(pool)
        .await?;
    Ok(())
}
