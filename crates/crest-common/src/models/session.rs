//! Session domain models: browser cookie sessions, native HMAC sessions,
//! refresh tokens, and the unified principal handed to route handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the enrollment / login flow currently stands for one cookie session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Anonymous,
    AwaitingOtp,
    OtpVerified,
    AwaitingBackupCodes,
    AwaitingCredentialEnrollment,
    AwaitingProfile,
    Complete,
}

/// Server-side browser session, addressed by the opaque cookie value.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CookieSession {
    /// Opaque token stored in the cookie
    pub id: String,
    /// NULL while the flow is still anonymous
    pub user_id: Option<Uuid>,
    /// Address the in-progress flow is bound to
    pub pending_address: Option<String>,
    pub flow_state: FlowState,
    pub client_handle: Option<String>,
    pub device_id: Option<i64>,
    /// One-shot CSRF token for embedded-browser assertion flows
    pub csrf_state: Option<String>,
    /// Invitation validated at enrollment, consumed at OTP verification
    pub pending_invite_id: Option<Uuid>,
    /// Consecutive backup-code failures in this session
    pub backup_failures: i64,
    pub last_backup_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-device symmetric-keyed session for native clients. Every request is
/// signed with `secret`; the secret leaves the server exactly once, in the
/// mint response.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HmacSession {
    pub client_handle: String,
    pub user_id: Uuid,
    pub device_id: i64,
    /// 128-bit secret, hex-encoded
    #[serde(skip_serializing)]
    pub secret: String,
    pub device_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Opaque long-lived refresh token with single-use rotation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefreshToken {
    #[serde(skip_serializing)]
    pub token: String,
    pub client_handle: String,
    pub user_id: Uuid,
    pub rotation_count: i64,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// How a request authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Cookie,
    Hmac,
}

/// Unified authenticated caller, produced by the dual-mode verifier.
/// Handlers must not branch on `method` except for side channels.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub device_id: i64,
    pub client_handle: String,
    pub method: AuthMethod,
}
