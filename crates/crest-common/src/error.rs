//! Centralized error types for Crest.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! error variants that can be directly converted to API responses. Every
//! response carries a stable machine-readable code plus a human-readable
//! message; auth failures avoid disclosing whether an address is enrolled
//! except where the enrollment flow itself makes that unavoidable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all Crest services.
#[derive(Debug, thiserror::Error)]
pub enum CrestError {
    // === Input errors ===
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Refused by server policy: {0}")]
    PolicyRefused(String),

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Flow errors ===
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Forbidden")]
    Forbidden,

    #[error("Wrong point in the authentication flow")]
    StateMismatch,

    // === Credential errors ===
    #[error("Credential invalid")]
    CredentialInvalid,

    #[error("Origin mismatch")]
    OriginMismatch,

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Credential unknown")]
    CredentialUnknown,

    #[error("User not found")]
    UserNotFound,

    #[error("Account not verified")]
    AccountUnverified,

    #[error("No credentials enrolled")]
    NoCredentialsEnrolled,

    // === OTP / backup-code errors ===
    #[error("Code invalid")]
    OtpInvalid,

    #[error("Code expired")]
    OtpExpired,

    #[error("Please wait {0} seconds before requesting a new code")]
    CooldownActive(u64),

    #[error("Too many attempts. Retry in {0} seconds")]
    TooEarly(u64),

    #[error("No backup codes on file")]
    NoBackupCodes,

    #[error("Backup codes can only be regenerated once nearly exhausted")]
    RegenerateNotYetAllowed,

    // === Session errors ===
    #[error("No credentials presented")]
    NoCredentials,

    #[error("Request expired")]
    RequestExpired,

    #[error("Nonce already seen")]
    DuplicateNonce,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("No session")]
    NoSession,

    #[error("Session expired")]
    SessionExpired,

    #[error("User inactive")]
    UserInactive,

    #[error("User missing")]
    UserMissing,

    #[error("Refresh token chain compromised")]
    ChainCompromised,

    // === Device / pre-key errors ===
    #[error("Device not found")]
    DeviceNotFound,

    #[error("One-time pre-key pool is empty")]
    PreKeyPoolEmpty,

    #[error("Cannot remove the device this session belongs to")]
    CurrentDeviceRefused,

    // === Channel errors ===
    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Not a member of this channel")]
    NotMember,

    #[error("The channel owner cannot leave")]
    OwnerCannotLeave,

    // === Token / mint errors ===
    #[error("Token revoked")]
    TokenRevoked,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    TokenInvalid,

    // === Resource errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    // === Infrastructure errors ===
    #[error("Write operation `{label}` timed out")]
    WriteTimeout { label: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl CrestError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedInput(_) | Self::InvalidAddress | Self::Validation { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::PolicyRefused(_) => StatusCode::FORBIDDEN,
            Self::NotAuthenticated | Self::NoCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::StateMismatch => StatusCode::CONFLICT,
            Self::CredentialInvalid
            | Self::OriginMismatch
            | Self::ChallengeMismatch
            | Self::CredentialUnknown
            | Self::AccountUnverified
            | Self::NoCredentialsEnrolled => StatusCode::UNAUTHORIZED,
            Self::UserNotFound | Self::UserMissing => StatusCode::NOT_FOUND,
            Self::OtpInvalid | Self::OtpExpired => StatusCode::UNAUTHORIZED,
            Self::CooldownActive(_) | Self::TooEarly(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NoBackupCodes | Self::RegenerateNotYetAllowed => StatusCode::CONFLICT,
            Self::RequestExpired
            | Self::DuplicateNonce
            | Self::InvalidSignature
            | Self::NoSession
            | Self::SessionExpired
            | Self::UserInactive
            | Self::ChainCompromised => StatusCode::UNAUTHORIZED,
            Self::DeviceNotFound | Self::ChannelNotFound | Self::NotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::PreKeyPoolEmpty => StatusCode::GONE,
            Self::CurrentDeviceRefused | Self::OwnerCannotLeave => StatusCode::CONFLICT,
            Self::NotMember => StatusCode::FORBIDDEN,
            Self::TokenRevoked | Self::TokenExpired | Self::TokenInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Self::AlreadyExists { .. } => StatusCode::CONFLICT,
            Self::WriteTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedInput(_) => "MALFORMED_INPUT",
            Self::InvalidAddress => "INVALID_ADDRESS",
            Self::PolicyRefused(_) => "POLICY_REFUSED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::StateMismatch => "STATE_MISMATCH",
            Self::CredentialInvalid => "CREDENTIAL_INVALID",
            Self::OriginMismatch => "ORIGIN_MISMATCH",
            Self::ChallengeMismatch => "CHALLENGE_MISMATCH",
            Self::CredentialUnknown => "CREDENTIAL_UNKNOWN",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::AccountUnverified => "ACCOUNT_UNVERIFIED",
            Self::NoCredentialsEnrolled => "NO_CREDENTIALS_ENROLLED",
            Self::OtpInvalid => "OTP_INVALID",
            Self::OtpExpired => "OTP_EXPIRED",
            Self::CooldownActive(_) => "COOLDOWN_ACTIVE",
            Self::TooEarly(_) => "TOO_EARLY",
            Self::NoBackupCodes => "NO_BACKUP_CODES",
            Self::RegenerateNotYetAllowed => "REGENERATE_NOT_YET_ALLOWED",
            Self::NoCredentials => "NO_CREDENTIALS",
            Self::RequestExpired => "REQUEST_EXPIRED",
            Self::DuplicateNonce => "DUPLICATE_NONCE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::NoSession => "NO_SESSION",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::UserInactive => "USER_INACTIVE",
            Self::UserMissing => "USER_MISSING",
            Self::ChainCompromised => "CHAIN_COMPROMISED",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::PreKeyPoolEmpty => "PREKEY_POOL_EMPTY",
            Self::CurrentDeviceRefused => "CURRENT_DEVICE_REFUSED",
            Self::ChannelNotFound => "CHANNEL_NOT_FOUND",
            Self::NotMember => "NOT_MEMBER",
            Self::OwnerCannotLeave => "OWNER_CANNOT_LEAVE",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::WriteTimeout { .. } => "WRITE_TIMEOUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Seconds the caller should wait before retrying, when applicable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::CooldownActive(s) | Self::TooEarly(s) => Some(*s),
            _ => None,
        }
    }
}

impl IntoResponse for CrestError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            CrestError::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            CrestError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
            retry_after_secs: self.retry_after_secs(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using CrestError.
pub type CrestResult<T> = Result<T, CrestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_carries_retry_after() {
        let err = CrestError::CooldownActive(42);
        assert_eq!(err.retry_after_secs(), Some(42));
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_code(), "COOLDOWN_ACTIVE");
    }

    #[test]
    fn replay_is_unauthorized() {
        assert_eq!(
            CrestError::DuplicateNonce.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
