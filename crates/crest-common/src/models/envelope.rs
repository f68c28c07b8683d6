//! Envelope domain models — opaque ciphertext routed per recipient device.
//!
//! The server never decrypts payloads. One logical message becomes exactly
//! one stored envelope per recipient device; inbox reads are FIFO in
//! insertion order, keyed by `(receiver_user, receiver_device)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored ciphertext envelope addressed to one recipient device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Envelope {
    /// Insertion-ordered rowid; inbox reads sort by this ascending
    pub seq: i64,
    /// Client-chosen logical message id; shared by every per-device copy
    pub message_id: String,
    pub sender_user_id: Uuid,
    pub sender_device_id: i64,
    pub receiver_user_id: Uuid,
    pub receiver_device_id: i64,
    /// Set for group traffic, NULL for direct envelopes
    pub channel_id: Option<Uuid>,
    /// Client-set message kind tag; opaque to the server
    pub kind: String,
    /// Client-set ciphertext type tag (e.g. 4 for sender-key messages)
    pub cipher_kind: i64,
    /// Opaque ciphertext exactly as uploaded
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Direct send: the caller already encrypted per device.
#[derive(Debug, Deserialize)]
pub struct DirectSendRequest {
    pub message_id: String,
    pub receiver_user_id: Uuid,
    #[serde(default)]
    pub kind: Option<String>,
    pub cipher_kind: i64,
    /// One ciphertext per recipient device
    pub envelopes: Vec<DirectEnvelope>,
}

#[derive(Debug, Deserialize)]
pub struct DirectEnvelope {
    pub receiver_device_id: i64,
    pub payload: String,
}

/// Group send: one ciphertext fanned out to every member device.
#[derive(Debug, Deserialize)]
pub struct GroupSendRequest {
    pub message_id: String,
    pub ciphertext: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub cipher_kind: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Envelope deletion contract. Narrowest match wins: with both receiver
/// fields set, one envelope; with only the device, every copy for that
/// device; with neither, every copy of the message.
#[derive(Debug, Deserialize)]
pub struct DeleteEnvelopesRequest {
    pub message_id: String,
    pub receiver_user_id: Option<Uuid>,
    pub receiver_device_id: Option<i64>,
}
