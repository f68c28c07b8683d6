//! Envelope fan-out engine.
//!
//! One logical message becomes exactly one stored envelope per recipient
//! device. Group sends are gated on channel membership and exclude the
//! sender's own device; the whole batch lands in a single serialized write,
//! so failure is atomic at the batch level. The server never interprets
//! `kind`, `cipher_kind`, or the payload.

use chrono::{DateTime, Utc};
use crest_common::error::{CrestError, CrestResult};
use uuid::Uuid;

use crate::Database;
use crate::repository::envelopes::NewEnvelope;
use crate::repository::{channels, devices, envelopes};

/// Direct (1:1 or self multi-device) send: the caller already produced one
/// ciphertext per recipient device.
pub struct DirectSend {
    pub message_id: String,
    pub receiver_user_id: Uuid,
    pub kind: String,
    pub cipher_kind: i64,
    /// `(receiver_device_id, payload)`
    pub per_device: Vec<(i64, String)>,
}

/// Group send: one ciphertext fanned out to every member device.
pub struct GroupSend {
    pub channel_id: Uuid,
    pub message_id: String,
    pub ciphertext: String,
    pub kind: String,
    pub cipher_kind: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Store a direct envelope batch. Every named receiver device must belong
/// to the receiver user at write time.
pub async fn send_direct(
    db: &Database,
    sender_user_id: Uuid,
    sender_device_id: i64,
    send: DirectSend,
) -> CrestResult<usize> {
    db.writer
        .enqueue("envelope-direct", move |pool| async move {
            let now = Utc::now();
            let mut batch = Vec::with_capacity(send.per_device.len());
            for (receiver_device_id, payload) in &send.per_device {
                devices::find(&pool, send.receiver_user_id, *receiver_device_id)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::DeviceNotFound)?;
                batch.push(NewEnvelope {
                    message_id: send.message_id.clone(),
                    sender_user_id,
                    sender_device_id,
                    receiver_user_id: send.receiver_user_id,
                    receiver_device_id: *receiver_device_id,
                    channel_id: None,
                    kind: send.kind.clone(),
                    cipher_kind: send.cipher_kind,
                    payload: payload.clone(),
                    created_at: now,
                });
            }
            envelopes::insert_batch(&pool, &batch)
                .await
                .map_err(CrestError::Internal)
        })
        .await
}

/// Fan a group message out to every device of every channel recipient
/// (owner ∪ members, deduped), except the sender's own device.
pub async fn send_group(
    db: &Database,
    sender_user_id: Uuid,
    sender_device_id: i64,
    send: GroupSend,
) -> CrestResult<usize> {
    db.writer
        .enqueue("envelope-fanout", move |pool| async move {
            channels::find(&pool, send.channel_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::ChannelNotFound)?;
            if !channels::is_owner_or_member(&pool, send.channel_id, sender_user_id)
                .await
                .map_err(CrestError::Internal)?
            {
                return Err(CrestError::NotMember);
            }

            let created_at = send.timestamp.unwrap_or_else(Utc::now);
            let recipients = channels::recipient_user_ids(&pool, send.channel_id)
                .await
                .map_err(CrestError::Internal)?;

            let mut batch = Vec::new();
            for user_id in recipients {
                for device in devices::list_for_user(&pool, user_id)
                    .await
                    .map_err(CrestError::Internal)?
                {
                    if device.user_id == sender_user_id && device.device_id == sender_device_id {
                        continue;
                    }
                    batch.push(NewEnvelope {
                        message_id: send.message_id.clone(),
                        sender_user_id,
                        sender_device_id,
                        receiver_user_id: device.user_id,
                        receiver_device_id: device.device_id,
                        channel_id: Some(send.channel_id),
                        kind: send.kind.clone(),
                        cipher_kind: send.cipher_kind,
                        payload: send.ciphertext.clone(),
                        created_at,
                    });
                }
            }
            envelopes::insert_batch(&pool, &batch)
                .await
                .map_err(CrestError::Internal)
        })
        .await
}

/// Delete envelopes for a message, narrowed by the optional receiver
/// fields. Only a sender or receiver of at least one matching envelope may
/// delete.
pub async fn delete_envelopes(
    db: &Database,
    caller_user_id: Uuid,
    message_id: String,
    receiver_user_id: Option<Uuid>,
    receiver_device_id: Option<i64>,
) -> CrestResult<u64> {
    db.writer
        .enqueue("envelope-delete", move |pool| async move {
            let matching = envelopes::list_matching(
                &pool,
                &message_id,
                receiver_user_id,
                receiver_device_id,
            )
            .await
            .map_err(CrestError::Internal)?;
            if matching.is_empty() {
                return Ok(0);
            }
            let permitted = matching.iter().any(|e| {
                e.sender_user_id == caller_user_id || e.receiver_user_id == caller_user_id
            });
            if !permitted {
                return Err(CrestError::Forbidden);
            }
            envelopes::delete_matching(&pool, &message_id, receiver_user_id, receiver_device_id)
                .await
                .map_err(CrestError::Internal)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::users;

    /// S3-shaped scenario: owner with one device, m1 with two, m2 with one;
    /// m1's first device sends.
    #[tokio::test]
    async fn group_fanout_excludes_the_sending_device() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = &db.pool;

        let owner = users::create_if_absent(pool, "o@example.com").await.unwrap();
        let m1 = users::create_if_absent(pool, "m1@example.com").await.unwrap();
        let m2 = users::create_if_absent(pool, "m2@example.com").await.unwrap();

        devices::create(pool, owner.id, "o-1", None, None, None).await.unwrap();
        devices::create(pool, m1.id, "m1-1", None, None, None).await.unwrap();
        devices::create(pool, m1.id, "m1-2", None, None, None).await.unwrap();
        devices::create(pool, m2.id, "m2-1", None, None, None).await.unwrap();

        let channel = channels::create(
            pool,
            "general",
            crest_common::models::channel::ChannelKind::Signal,
            false,
            owner.id,
            None,
        )
        .await
        .unwrap();
        channels::add_member(pool, channel.id, m1.id, 0).await.unwrap();
        channels::add_member(pool, channel.id, m2.id, 0).await.unwrap();

        let stored = send_group(
            &db,
            m1.id,
            1,
            GroupSend {
                channel_id: channel.id,
                message_id: "M".into(),
                ciphertext: "XYZ".into(),
                kind: "message".into(),
                cipher_kind: 4,
                timestamp: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(stored, 4);

        // m1's second device got it, the sending device did not.
        let m1_d2 = envelopes::inbox_channel(pool, m1.id, 2, channel.id).await.unwrap();
        assert_eq!(m1_d2.len(), 1);
        assert_eq!(m1_d2[0].payload, "XYZ");
        assert_eq!(m1_d2[0].cipher_kind, 4);
        let m1_d1 = envelopes::inbox_channel(pool, m1.id, 1, channel.id).await.unwrap();
        assert!(m1_d1.is_empty());

        let owner_inbox = envelopes::inbox_channel(pool, owner.id, 1, channel.id).await.unwrap();
        assert_eq!(owner_inbox.len(), 1);
        assert_eq!(owner_inbox[0].receiver_user_id, owner.id);
        assert_eq!(owner_inbox[0].receiver_device_id, 1);
    }

    #[tokio::test]
    async fn non_member_send_is_rejected() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = &db.pool;
        let owner = users::create_if_absent(pool, "o2@example.com").await.unwrap();
        let outsider = users::create_if_absent(pool, "x@example.com").await.unwrap();
        devices::create(pool, owner.id, "o2-1", None, None, None).await.unwrap();
        devices::create(pool, outsider.id, "x-1", None, None, None).await.unwrap();

        let channel = channels::create(
            pool,
            "private",
            crest_common::models::channel::ChannelKind::Signal,
            true,
            owner.id,
            None,
        )
        .await
        .unwrap();

        let err = send_group(
            &db,
            outsider.id,
            1,
            GroupSend {
                channel_id: channel.id,
                message_id: "M2".into(),
                ciphertext: "ZZZ".into(),
                kind: "message".into(),
                cipher_kind: 4,
                timestamp: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrestError::NotMember));
    }

    #[tokio::test]
    async fn delete_requires_sender_or_receiver() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = &db.pool;
        let a = users::create_if_absent(pool, "a@example.com").await.unwrap();
        let b = users::create_if_absent(pool, "b@example.com").await.unwrap();
        let c = users::create_if_absent(pool, "c@example.com").await.unwrap();
        devices::create(pool, a.id, "a-1", None, None, None).await.unwrap();
        devices::create(pool, b.id, "b-1", None, None, None).await.unwrap();
        devices::create(pool, c.id, "c-1", None, None, None).await.unwrap();

        send_direct(
            &db,
            a.id,
            1,
            DirectSend {
                message_id: "D".into(),
                receiver_user_id: b.id,
                kind: "message".into(),
                cipher_kind: 1,
                per_device: vec![(1, "CT".into())],
            },
        )
        .await
        .unwrap();

        // A stranger may not delete.
        assert!(matches!(
            delete_envelopes(&db, c.id, "D".into(), None, None).await,
            Err(CrestError::Forbidden)
        ));
        // The receiver may.
        let deleted = delete_envelopes(&db, b.id, "D".into(), None, None).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
