//! Enrollment artifacts: one-time codes and invitations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// One-time numeric code. At most one active per address.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimeCode {
    pub address: String,
    #[serde(skip_serializing)]
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Server invitation. On invite-only servers, enrollment requires one of
/// these, unused and unexpired, matching the enrolling address when bound.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invite {
    /// Also the `jti` of the minted invitation token
    pub id: Uuid,
    /// Bound address; NULL invites admit any address
    pub address: Option<String>,
    pub created_by: Option<Uuid>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BeginEnrollmentRequest {
    #[validate(length(min = 3, max = 254))]
    pub address: String,
    pub invitation_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyOtpRequest {
    #[validate(length(min = 3, max = 254))]
    pub address: String,
    #[validate(length(min = 5, max = 6))]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    pub address: Option<String>,
    /// Hours until expiry; server default when absent
    pub ttl_hours: Option<i64>,
}
