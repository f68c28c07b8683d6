//! Store-level invariant tests: device numbering, handle uniqueness, and
//! inbox binding.

use crest_db::Database;
use crest_db::fanout::{self, DirectSend};
use crest_db::repository::{devices, envelopes, users};

#[tokio::test]
async fn device_numbers_form_a_dense_prefix() {
    let db = Database::connect_in_memory().await.unwrap();
    let user = users::create_if_absent(&db.pool, "dense@example.com").await.unwrap();

    for i in 1..=5 {
        let d = devices::create(&db.pool, user.id, &format!("h-{i}"), None, None, None)
            .await
            .unwrap();
        assert_eq!(d.device_id, i);
    }

    let ids: Vec<i64> = devices::list_for_user(&db.pool, user.id)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.device_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn client_handles_are_globally_unique() {
    let db = Database::connect_in_memory().await.unwrap();
    let a = users::create_if_absent(&db.pool, "ua@example.com").await.unwrap();
    let b = users::create_if_absent(&db.pool, "ub@example.com").await.unwrap();

    devices::create(&db.pool, a.id, "same-handle", None, None, None)
        .await
        .unwrap();
    // A second row with the same handle, even under another user, is refused
    // by the store itself.
    assert!(
        devices::create(&db.pool, b.id, "same-handle", None, None, None)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn inbox_reads_only_return_the_callers_device_rows() {
    let db = Database::connect_in_memory().await.unwrap();
    let sender = users::create_if_absent(&db.pool, "snd@example.com").await.unwrap();
    let receiver = users::create_if_absent(&db.pool, "rcv@example.com").await.unwrap();
    devices::create(&db.pool, sender.id, "snd-1", None, None, None).await.unwrap();
    devices::create(&db.pool, receiver.id, "rcv-1", None, None, None).await.unwrap();
    devices::create(&db.pool, receiver.id, "rcv-2", None, None, None).await.unwrap();

    fanout::send_direct(
        &db,
        sender.id,
        1,
        DirectSend {
            message_id: "m-1".into(),
            receiver_user_id: receiver.id,
            kind: "message".into(),
            cipher_kind: 1,
            per_device: vec![(1, "for-d1".into()), (2, "for-d2".into())],
        },
    )
    .await
    .unwrap();

    let d1 = envelopes::inbox_direct(&db.pool, receiver.id, 1, sender.id).await.unwrap();
    assert_eq!(d1.len(), 1);
    assert!(d1.iter().all(|e| {
        e.receiver_user_id == receiver.id && e.receiver_device_id == 1
    }));
    assert_eq!(d1[0].payload, "for-d1");

    let d2 = envelopes::inbox_direct(&db.pool, receiver.id, 2, sender.id).await.unwrap();
    assert_eq!(d2.len(), 1);
    assert_eq!(d2[0].payload, "for-d2");

    // Re-reads are not deduplicated server-side.
    let again = envelopes::inbox_direct(&db.pool, receiver.id, 1, sender.id).await.unwrap();
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn inbox_order_follows_insertion() {
    let db = Database::connect_in_memory().await.unwrap();
    let sender = users::create_if_absent(&db.pool, "ord-s@example.com").await.unwrap();
    let receiver = users::create_if_absent(&db.pool, "ord-r@example.com").await.unwrap();
    devices::create(&db.pool, sender.id, "ord-s-1", None, None, None).await.unwrap();
    devices::create(&db.pool, receiver.id, "ord-r-1", None, None, None).await.unwrap();

    for n in 0..4 {
        fanout::send_direct(
            &db,
            sender.id,
            1,
            DirectSend {
                message_id: format!("m-{n}"),
                receiver_user_id: receiver.id,
                kind: "message".into(),
                cipher_kind: 1,
                per_device: vec![(1, format!("payload-{n}"))],
            },
        )
        .await
        .unwrap();
    }

    let inbox = envelopes::inbox_direct(&db.pool, receiver.id, 1, sender.id).await.unwrap();
    let payloads: Vec<&str> = inbox.iter().map(|e| e.payload.as_str()).collect();
    assert_eq!(payloads, vec!["payload-0", "payload-1", "payload-2", "payload-3"]);
    assert!(inbox.windows(2).all(|w| w[0].seq < w[1].seq));
}
