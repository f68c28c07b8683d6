//! Pre-key repository — identity keys, the append-only signed pre-key
//! series, and the consume-once one-time pool.

use anyhow::Result;
use chrono::Utc;
use crest_common::models::device::{OneTimePreKeyPublic, SignedPreKey};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Upsert the identity key + registration id onto the device row.
pub async fn publish_identity(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
    identity_key: &str,
    registration_id: i64,
) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE devices SET identity_key = ?, registration_id = ? WHERE user_id = ? AND device_id = ?",
    )
    .bind(identity_key)
    .bind(registration_id)
    .bind(user_id)
    .bind(device_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

/// Append a signed pre-key. Old entries are kept; lookups take the newest.
pub async fn append_signed(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
    prekey_id: i64,
    blob: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO signed_prekeys (user_id, device_id, prekey_id, blob, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .bind(prekey_id)
    .bind(blob)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Newest signed pre-key for a device, by insertion order.
pub async fn newest_signed(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
) -> Result<Option<SignedPreKey>> {
    let row = sqlx::query_as::<_, SignedPreKey>(
        r#"
        SELECT user_id, device_id, prekey_id, blob, created_at
        FROM signed_prekeys
        WHERE user_id = ? AND device_id = ?
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Bulk-upsert one-time pre-keys for a device.
pub async fn upsert_one_time_bulk(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
    keys: &[(i64, String)],
) -> Result<usize> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for (prekey_id, blob) in keys {
        sqlx::query(
            r#"
            INSERT INTO one_time_prekeys (user_id, device_id, prekey_id, blob, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, device_id, prekey_id) DO UPDATE SET blob = excluded.blob
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(prekey_id)
        .bind(blob)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(keys.len())
}

/// Destroy and return one one-time pre-key, chosen uniformly at random from
/// the pool. Returns `None` when the pool is empty. Single statement, so
/// selection and destruction are one logical operation. Uniform over the
/// pool; no unpredictability claim.
pub async fn consume_one_random(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
) -> Result<Option<OneTimePreKeyPublic>> {
    let row = sqlx::query_as::<_, OneTimePreKeyPublic>(
        r#"
        DELETE FROM one_time_prekeys
        WHERE rowid IN (
            SELECT rowid FROM one_time_prekeys
            WHERE user_id = ? AND device_id = ?
            ORDER BY RANDOM()
            LIMIT 1
        )
        RETURNING prekey_id, blob
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn count_one_time(pool: &SqlitePool, user_id: Uuid, device_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ? AND device_id = ?",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Remaining one-time pre-key ids for a device, ascending.
pub async fn list_one_time_ids(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT prekey_id FROM one_time_prekeys WHERE user_id = ? AND device_id = ? ORDER BY prekey_id ASC",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
