//! Device and pre-key domain models.
//!
//! A device is `(user_id, device_id)` where `device_id` is a per-user
//! positive integer the server assigns densely from 1. Clients identify
//! themselves with an opaque, globally unique `client_handle`; presenting a
//! known handle under a different account triggers a reclaim that destroys
//! the old device and everything keyed by it.
//!
//! The server stores only *public* Signal-style key material: one identity
//! key per device, an append-only series of signed pre-keys (newest wins),
//! and a pool of one-time pre-keys consumed exactly once at bundle fetch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A registered device belonging to a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub user_id: Uuid,
    /// Per-user device number, dense and starting at 1
    pub device_id: i64,
    /// Client-generated opaque handle, unique across all users
    pub client_handle: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    /// Best-effort resolved location ("unknown" when lookups fail)
    pub location: Option<String>,
    /// Public identity key, base64-encoded; absent until published
    pub identity_key: Option<String>,
    /// Client-chosen numeric registration id
    pub registration_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A signed pre-key record. Append-only per device; lookups take the newest.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPreKey {
    pub user_id: Uuid,
    pub device_id: i64,
    pub prekey_id: i64,
    /// Opaque blob: public key plus signature, base64-encoded by the client
    pub blob: String,
    pub created_at: DateTime<Utc>,
}

/// One entry in a device's one-time pre-key pool.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePreKey {
    pub user_id: Uuid,
    pub device_id: i64,
    pub prekey_id: i64,
    pub blob: String,
    pub created_at: DateTime<Utc>,
}

/// Public slice of a one-time pre-key, as returned inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePreKeyPublic {
    pub prekey_id: i64,
    pub blob: String,
}

/// Snapshot of one device's key material handed to a session initiator.
/// The one-time pre-key, when present, has already been destroyed server-side.
#[derive(Debug, Clone, Serialize)]
pub struct KeyBundle {
    pub user_id: Uuid,
    pub device_id: i64,
    pub identity_key: Option<String>,
    pub registration_id: Option<i64>,
    pub signed_prekey: Option<SignedPreKeyPublic>,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

/// Public slice of a signed pre-key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub prekey_id: i64,
    pub blob: String,
}

impl From<SignedPreKey> for SignedPreKeyPublic {
    fn from(s: SignedPreKey) -> Self {
        Self {
            prekey_id: s.prekey_id,
            blob: s.blob,
        }
    }
}

/// Minimal key status for client-side invariants.
#[derive(Debug, Clone, Serialize)]
pub struct PreKeyStatus {
    pub identity_key: Option<String>,
    pub newest_signed_prekey_id: Option<i64>,
    pub one_time_prekey_count: i64,
}

/// Client's claimed key state, compared against server truth by
/// `validate_and_sync`.
#[derive(Debug, Deserialize)]
pub struct ClientKeyState {
    pub identity_key: Option<String>,
    pub signed_prekey_id: Option<i64>,
    pub one_time_prekey_ids: Vec<i64>,
}

/// Diff describing what the client must re-publish or forget.
/// `ok == true` means everything matches and the other fields are empty.
#[derive(Debug, Serialize)]
pub struct KeySyncDiff {
    pub ok: bool,
    pub identity_missing: bool,
    pub signed_prekey_missing: bool,
    /// One-time pre-key ids the client still holds but the server has consumed
    pub consumed_one_time_prekey_ids: Vec<i64>,
}

// ============================================================
// API request / response shapes
// ============================================================

/// Publish (or re-publish) a device's identity key.
#[derive(Debug, Deserialize, Validate)]
pub struct PublishIdentityRequest {
    pub identity_key: String,
    #[validate(range(min = 1))]
    pub registration_id: i64,
}

/// Append a signed pre-key rotation.
#[derive(Debug, Deserialize, Validate)]
pub struct PublishSignedPreKeyRequest {
    #[validate(range(min = 1))]
    pub prekey_id: i64,
    pub blob: String,
}

/// Bulk one-time pre-key upload.
#[derive(Debug, Deserialize)]
pub struct PublishPreKeysRequest {
    pub prekeys: Vec<PreKeyUpload>,
}

#[derive(Debug, Deserialize)]
pub struct PreKeyUpload {
    pub prekey_id: i64,
    pub blob: String,
}

/// Device info exposed to its owner.
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub device_id: i64,
    pub client_handle: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<Device> for DeviceResponse {
    fn from(d: Device) -> Self {
        Self {
            device_id: d.device_id,
            client_handle: d.client_handle,
            ip: d.ip,
            user_agent: d.user_agent,
            location: d.location,
            created_at: d.created_at,
            last_seen_at: d.last_seen_at,
        }
    }
}
