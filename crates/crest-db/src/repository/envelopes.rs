//! Envelope repository — per-device ciphertext rows and FIFO inbox reads.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crest_common::models::envelope::Envelope;
use sqlx::SqlitePool;
use uuid::Uuid;

/// One envelope to insert; `seq` and `created_at` are assigned at write time.
#[derive(Debug, Clone)]
pub struct NewEnvelope {
    pub message_id: String,
    pub sender_user_id: Uuid,
    pub sender_device_id: i64,
    pub receiver_user_id: Uuid,
    pub receiver_device_id: i64,
    pub channel_id: Option<Uuid>,
    pub kind: String,
    pub cipher_kind: i64,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Insert a batch of envelopes in one transaction. Failure is atomic at the
/// batch level. Serializer-closure only.
pub async fn insert_batch(pool: &SqlitePool, envelopes: &[NewEnvelope]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for env in envelopes {
        sqlx::query(
            r#"
            INSERT INTO envelopes
                (message_id, sender_user_id, sender_device_id,
                 receiver_user_id, receiver_device_id, channel_id,
                 kind, cipher_kind, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&env.message_id)
        .bind(env.sender_user_id)
        .bind(env.sender_device_id)
        .bind(env.receiver_user_id)
        .bind(env.receiver_device_id)
        .bind(env.channel_id)
        .bind(&env.kind)
        .bind(env.cipher_kind)
        .bind(&env.payload)
        .bind(env.created_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(envelopes.len())
}

/// Direct inbox: envelopes for the caller's device with no channel, where
/// the peer is either the sender or the caller themselves (own multi-device
/// traffic). Insertion order.
pub async fn inbox_direct(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
    peer_user_id: Uuid,
) -> Result<Vec<Envelope>> {
    let rows = sqlx::query_as::<_, Envelope>(
        r#"
        SELECT * FROM envelopes
        WHERE receiver_user_id = ? AND receiver_device_id = ?
          AND channel_id IS NULL
          AND sender_user_id IN (?, ?)
        ORDER BY seq ASC
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .bind(peer_user_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Channel inbox for the caller's device, insertion order.
pub async fn inbox_channel(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
    channel_id: Uuid,
) -> Result<Vec<Envelope>> {
    let rows = sqlx::query_as::<_, Envelope>(
        r#"
        SELECT * FROM envelopes
        WHERE receiver_user_id = ? AND receiver_device_id = ? AND channel_id = ?
        ORDER BY seq ASC
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All-channels inbox: every channel envelope for the caller's device where
/// the caller is currently owner or member of the channel.
pub async fn inbox_all_channels(
    pool: &SqlitePool,
    user_id: Uuid,
    device_id: i64,
) -> Result<Vec<Envelope>> {
    let rows = sqlx::query_as::<_, Envelope>(
        r#"
        SELECT e.* FROM envelopes e
        JOIN channels c ON c.id = e.channel_id
        LEFT JOIN channel_members m ON m.channel_id = c.id AND m.user_id = ?
        WHERE e.receiver_user_id = ? AND e.receiver_device_id = ?
          AND (c.owner_user_id = ? OR m.user_id IS NOT NULL)
        ORDER BY e.seq ASC
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .bind(device_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Legacy read bound by device number only, with no user binding. This can
/// cross user boundaries when device numbers collide, which is exactly why
/// the route refuses it unless the operator opted in.
pub async fn inbox_by_device_only(pool: &SqlitePool, device_id: i64) -> Result<Vec<Envelope>> {
    let rows = sqlx::query_as::<_, Envelope>(
        "SELECT * FROM envelopes WHERE receiver_device_id = ? ORDER BY seq ASC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Envelopes matching a delete request, used for the caller-permission check
/// before deletion.
pub async fn list_matching(
    pool: &SqlitePool,
    message_id: &str,
    receiver_user_id: Option<Uuid>,
    receiver_device_id: Option<i64>,
) -> Result<Vec<Envelope>> {
    let rows = sqlx::query_as::<_, Envelope>(
        r#"
        SELECT * FROM envelopes
        WHERE message_id = ?
          AND (? IS NULL OR receiver_user_id = ?)
          AND (? IS NULL OR receiver_device_id = ?)
        ORDER BY seq ASC
        "#,
    )
    .bind(message_id)
    .bind(receiver_user_id)
    .bind(receiver_user_id)
    .bind(receiver_device_id)
    .bind(receiver_device_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Delete envelopes matching the narrowing filters. Serializer-closure only.
pub async fn delete_matching(
    pool: &SqlitePool,
    message_id: &str,
    receiver_user_id: Option<Uuid>,
    receiver_device_id: Option<i64>,
) -> Result<u64> {
    let affected = sqlx::query(
        r#"
        DELETE FROM envelopes
        WHERE message_id = ?
          AND (? IS NULL OR receiver_user_id = ?)
          AND (? IS NULL OR receiver_device_id = ?)
        "#,
    )
    .bind(message_id)
    .bind(receiver_user_id)
    .bind(receiver_user_id)
    .bind(receiver_device_id)
    .bind(receiver_device_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected)
}
