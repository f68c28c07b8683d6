//! User model — the identity layer.
//!
//! Users are keyed by a random 128-bit id and a case-insensitive-unique
//! address. There are no passwords anywhere: accounts bootstrap through a
//! one-time code and then live on public-key credentials, backup codes, and
//! magic links. Credential and backup-code lists are stored as typed
//! sub-records on the user row; every mutation of them is a read-modify-write
//! inside a single write-serializer closure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;
use validator::Validate;

/// A Crest user account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Unique user ID (random 128-bit)
    pub id: Uuid,

    /// Contact address, unique case-insensitively (stored lowercased)
    pub address: String,

    /// Set once the first one-time code is confirmed
    pub verified: bool,

    /// Cleared to lock the account out of every auth path
    pub active: bool,

    /// Public display handle (unique when set)
    pub display_handle: Option<String>,

    /// Short handle for mentions (unique when set)
    pub short_handle: Option<String>,

    /// Profile image blob, at most 1 MiB
    #[serde(skip_serializing)]
    pub profile_image: Option<Vec<u8>>,

    /// Hashed backup codes with their used flags
    #[serde(skip_serializing)]
    pub backup_codes: Json<Vec<BackupCode>>,

    /// True once backup codes have been emitted; cleared by regeneration
    pub backup_codes_issued: bool,

    /// Enrolled public-key credentials
    #[serde(skip_serializing)]
    pub credentials: Json<Vec<StoredCredential>>,

    // Notification preferences — authoritative on/off switches for the
    // corresponding outbound mails.
    pub invite_email_enabled: bool,
    pub update_email_enabled: bool,
    pub cancel_email_enabled: bool,
    pub self_invite_email_enabled: bool,
    pub rsvp_to_organizer_email_enabled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One hashed backup code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCode {
    /// bcrypt hash of the plaintext code
    pub hash: String,
    pub used: bool,
}

/// One enrolled public-key credential.
///
/// `public_key` holds the broker's serialized credential record; the server
/// treats it opaquely and hands it back to the broker for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    /// Credential id exactly as presented by the authenticator (base64url)
    pub id: String,
    pub public_key: serde_json::Value,
    /// Declared transports; "hybrid" is always present
    pub transports: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub ip: Option<String>,
    pub location: Option<String>,
}

/// Outbound mail categories gated by user preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    /// Invitation to a channel or meeting
    Invite,
    /// Something the user participates in changed
    Update,
    /// Something the user participates in was cancelled
    Cancel,
    /// Confirmation of an invitation the user created for themselves
    SelfInvite,
    /// RSVP notification to an organizer
    RsvpToOrganizer,
    /// One-time codes and magic links; never preference-gated
    Authentication,
}

impl User {
    /// Whether this user wants mail of the given kind.
    pub fn wants(&self, kind: MailKind) -> bool {
        match kind {
            MailKind::Invite => self.invite_email_enabled,
            MailKind::Update => self.update_email_enabled,
            MailKind::Cancel => self.cancel_email_enabled,
            MailKind::SelfInvite => self.self_invite_email_enabled,
            MailKind::RsvpToOrganizer => self.rsvp_to_organizer_email_enabled,
            MailKind::Authentication => true,
        }
    }

    /// Count of backup codes not yet consumed.
    pub fn unused_backup_codes(&self) -> usize {
        self.backup_codes.0.iter().filter(|c| !c.used).count()
    }
}

/// Safe user representation for API responses (no sensitive fields).
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub address: String,
    pub verified: bool,
    pub display_handle: Option<String>,
    pub short_handle: Option<String>,
    pub credential_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            address: u.address,
            verified: u.verified,
            display_handle: u.display_handle,
            short_handle: u.short_handle,
            credential_count: u.credentials.0.len(),
            created_at: u.created_at,
        }
    }
}

/// Profile completion / update request.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 64))]
    pub display_handle: Option<String>,

    #[validate(length(min = 1, max = 32))]
    pub short_handle: Option<String>,

    /// Base64 image payload; decoded size is capped at 1 MiB
    pub profile_image: Option<String>,
}

/// Notification preference update — absent fields are left untouched.
#[derive(Debug, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub invite_email_enabled: Option<bool>,
    pub update_email_enabled: Option<bool>,
    pub cancel_email_enabled: Option<bool>,
    pub self_invite_email_enabled: Option<bool>,
    pub rsvp_to_organizer_email_enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_user() -> User {
        User {
            id: Uuid::new_v4(),
            address: "a@example.com".into(),
            verified: true,
            active: true,
            display_handle: None,
            short_handle: None,
            profile_image: None,
            backup_codes: Json(vec![
                BackupCode { hash: "x".into(), used: false },
                BackupCode { hash: "y".into(), used: true },
            ]),
            backup_codes_issued: true,
            credentials: Json(vec![]),
            invite_email_enabled: true,
            update_email_enabled: false,
            cancel_email_enabled: true,
            self_invite_email_enabled: false,
            rsvp_to_organizer_email_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn preference_gating() {
        let u = bare_user();
        assert!(u.wants(MailKind::Invite));
        assert!(!u.wants(MailKind::Update));
        assert!(u.wants(MailKind::Authentication));
    }

    #[test]
    fn unused_code_count() {
        assert_eq!(bare_user().unused_backup_codes(), 1);
    }
}
