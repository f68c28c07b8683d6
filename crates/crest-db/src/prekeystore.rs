//! Pre-key store operations — the serialized mutations and the read-side
//! status checks built on top of the pre-key repository.

use crest_common::error::{CrestError, CrestResult};
use crest_common::models::device::{ClientKeyState, KeyBundle, KeySyncDiff, PreKeyStatus};
use std::time::Duration;
use uuid::Uuid;

use crate::Database;
use crate::repository::{devices, prekeys};
use crate::serializer::Submit;

/// Upsert a device's identity key and registration id.
pub async fn publish_identity(
    db: &Database,
    user_id: Uuid,
    device_id: i64,
    identity_key: String,
    registration_id: i64,
) -> CrestResult<()> {
    db.writer
        .enqueue("prekey-identity", move |pool| async move {
            let updated =
                prekeys::publish_identity(&pool, user_id, device_id, &identity_key, registration_id)
                    .await
                    .map_err(CrestError::Internal)?;
            if !updated {
                return Err(CrestError::DeviceNotFound);
            }
            Ok(())
        })
        .await
}

/// Append a signed pre-key rotation.
pub async fn publish_signed_prekey(
    db: &Database,
    user_id: Uuid,
    device_id: i64,
    prekey_id: i64,
    blob: String,
) -> CrestResult<()> {
    db.writer
        .enqueue("prekey-signed", move |pool| async move {
            devices::find(&pool, user_id, device_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::DeviceNotFound)?;
            prekeys::append_signed(&pool, user_id, device_id, prekey_id, &blob)
                .await
                .map_err(CrestError::Internal)
        })
        .await
}

/// Bulk one-time pre-key publish with a soft deadline: past the deadline the
/// caller is told `Accepted` while the write continues, still ordered before
/// any later writes for the same device.
pub async fn publish_prekeys_bulk(
    db: &Database,
    user_id: Uuid,
    device_id: i64,
    keys: Vec<(i64, String)>,
    soft_deadline: Duration,
) -> CrestResult<Submit<usize>> {
    let outcome = db
        .writer
        .enqueue_soft("prekey-bulk", soft_deadline, move |pool| async move {
            devices::find(&pool, user_id, device_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::DeviceNotFound)?;
            prekeys::upsert_one_time_bulk(&pool, user_id, device_id, &keys)
                .await
                .map_err(CrestError::Internal)
        })
        .await;
    Ok(outcome)
}

/// Gather bundles for every device of the target user and of the requester
/// (minus the requesting device itself, which needs no session to itself).
/// Each selected one-time pre-key is destroyed before the response exists;
/// empty pools yield `one_time_prekey: None`.
pub async fn fetch_bundles(
    db: &Database,
    target_user_id: Uuid,
    requester_user_id: Uuid,
    requester_device_id: i64,
) -> CrestResult<Vec<KeyBundle>> {
    db.writer
        .enqueue("prekey-bundle-fetch", move |pool| async move {
            let mut targets = devices::list_for_user(&pool, target_user_id)
                .await
                .map_err(CrestError::Internal)?;
            if requester_user_id != target_user_id {
                targets.extend(
                    devices::list_for_user(&pool, requester_user_id)
                        .await
                        .map_err(CrestError::Internal)?,
                );
            }

            let mut bundles = Vec::with_capacity(targets.len());
            for device in targets {
                if device.user_id == requester_user_id && device.device_id == requester_device_id {
                    continue;
                }
                let signed = prekeys::newest_signed(&pool, device.user_id, device.device_id)
                    .await
                    .map_err(CrestError::Internal)?;
                let one_time =
                    prekeys::consume_one_random(&pool, device.user_id, device.device_id)
                        .await
                        .map_err(CrestError::Internal)?;
                bundles.push(KeyBundle {
                    user_id: device.user_id,
                    device_id: device.device_id,
                    identity_key: device.identity_key,
                    registration_id: device.registration_id,
                    signed_prekey: signed.map(Into::into),
                    one_time_prekey: one_time,
                });
            }
            Ok(bundles)
        })
        .await
}

/// Minimal key status for a device. Read-only.
pub async fn minimal_status(
    db: &Database,
    user_id: Uuid,
    device_id: i64,
) -> CrestResult<PreKeyStatus> {
    let device = devices::find(&db.pool, user_id, device_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::DeviceNotFound)?;
    let signed = prekeys::newest_signed(&db.pool, user_id, device_id)
        .await
        .map_err(CrestError::Internal)?;
    let count = prekeys::count_one_time(&db.pool, user_id, device_id)
        .await
        .map_err(CrestError::Internal)?;
    Ok(PreKeyStatus {
        identity_key: device.identity_key,
        newest_signed_prekey_id: signed.map(|s| s.prekey_id),
        one_time_prekey_count: count,
    })
}

/// Compare the client's claimed key state with server truth. Read-only.
pub async fn validate_and_sync(
    db: &Database,
    user_id: Uuid,
    device_id: i64,
    claimed: &ClientKeyState,
) -> CrestResult<KeySyncDiff> {
    let device = devices::find(&db.pool, user_id, device_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::DeviceNotFound)?;
    let signed = prekeys::newest_signed(&db.pool, user_id, device_id)
        .await
        .map_err(CrestError::Internal)?;
    let remaining = prekeys::list_one_time_ids(&db.pool, user_id, device_id)
        .await
        .map_err(CrestError::Internal)?;

    let identity_missing = match (&claimed.identity_key, &device.identity_key) {
        (Some(claimed), Some(actual)) => claimed != actual,
        (Some(_), None) => true,
        (None, _) => device.identity_key.is_none(),
    };
    let signed_prekey_missing = match (claimed.signed_prekey_id, signed.as_ref()) {
        (Some(claimed), Some(actual)) => claimed != actual.prekey_id,
        (Some(_), None) => true,
        (None, _) => signed.is_none(),
    };
    let consumed: Vec<i64> = claimed
        .one_time_prekey_ids
        .iter()
        .copied()
        .filter(|id| !remaining.contains(id))
        .collect();

    let ok = !identity_missing && !signed_prekey_missing && consumed.is_empty();
    Ok(KeySyncDiff {
        ok,
        identity_missing,
        signed_prekey_missing,
        consumed_one_time_prekey_ids: consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::users;

    async fn device_with_pool(db: &Database) -> (Uuid, Uuid) {
        let a = users::create_if_absent(&db.pool, "pk-a@example.com").await.unwrap();
        let b = users::create_if_absent(&db.pool, "pk-b@example.com").await.unwrap();
        devices::create(&db.pool, a.id, "pk-a-1", None, None, None).await.unwrap();
        devices::create(&db.pool, b.id, "pk-b-1", None, None, None).await.unwrap();
        prekeys::publish_identity(&db.pool, b.id, 1, "aWRr", 42).await.unwrap();
        prekeys::append_signed(&db.pool, b.id, 1, 3, "c2lnbmVk").await.unwrap();
        prekeys::upsert_one_time_bulk(
            &db.pool,
            b.id,
            1,
            &[(7, "b3Ri".into()), (8, "b3Rj".into())],
        )
        .await
        .unwrap();
        (a.id, b.id)
    }

    #[tokio::test]
    async fn one_shot_pool_drains_then_goes_null() {
        let db = Database::connect_in_memory().await.unwrap();
        let (a, b) = device_with_pool(&db).await;

        let first = fetch_bundles(&db, b, a, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        let first_otp = first[0].one_time_prekey.clone().unwrap();
        assert!([7, 8].contains(&first_otp.prekey_id));

        let second = fetch_bundles(&db, b, a, 1).await.unwrap();
        let second_otp = second[0].one_time_prekey.clone().unwrap();
        assert_ne!(first_otp.prekey_id, second_otp.prekey_id);

        // Pool exhausted: the field is null, nothing else is deleted.
        let third = fetch_bundles(&db, b, a, 1).await.unwrap();
        assert!(third[0].one_time_prekey.is_none());
        assert_eq!(third[0].signed_prekey.as_ref().unwrap().prekey_id, 3);
        assert_eq!(third[0].identity_key.as_deref(), Some("aWRr"));
    }

    #[tokio::test]
    async fn newest_signed_prekey_wins() {
        let db = Database::connect_in_memory().await.unwrap();
        let (a, b) = device_with_pool(&db).await;
        prekeys::append_signed(&db.pool, b, 1, 9, "bmV3ZXI").await.unwrap();

        let bundles = fetch_bundles(&db, b, a, 1).await.unwrap();
        assert_eq!(bundles[0].signed_prekey.as_ref().unwrap().prekey_id, 9);
    }

    #[tokio::test]
    async fn sync_reports_consumed_ids() {
        let db = Database::connect_in_memory().await.unwrap();
        let (a, b) = device_with_pool(&db).await;

        // Consume one key via a bundle fetch.
        let taken = fetch_bundles(&db, b, a, 1).await.unwrap()[0]
            .one_time_prekey
            .clone()
            .unwrap();

        let diff = validate_and_sync(
            &db,
            b,
            1,
            &ClientKeyState {
                identity_key: Some("aWRr".into()),
                signed_prekey_id: Some(3),
                one_time_prekey_ids: vec![7, 8],
            },
        )
        .await
        .unwrap();
        assert!(!diff.ok);
        assert_eq!(diff.consumed_one_time_prekey_ids, vec![taken.prekey_id]);
        assert!(!diff.identity_missing);
        assert!(!diff.signed_prekey_missing);
    }

    #[tokio::test]
    async fn status_counts_the_pool() {
        let db = Database::connect_in_memory().await.unwrap();
        let (_a, b) = device_with_pool(&db).await;
        let status = minimal_status(&db, b, 1).await.unwrap();
        assert_eq!(status.one_time_prekey_count, 2);
        assert_eq!(status.newest_signed_prekey_id, Some(3));
        assert_eq!(status.identity_key.as_deref(), Some("aWRr"));
    }
}
