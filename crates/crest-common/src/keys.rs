//! Key-material sanity checks and constant-time helpers.
//!
//! The server never performs Signal Protocol cryptography; clients do. This
//! module only validates the shape of uploaded public key material (valid
//! base64, expected byte lengths) and provides the constant-time string
//! comparison used for codes and signatures.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use subtle::ConstantTimeEq;

/// Byte length of a Curve25519 public key.
const PUBLIC_KEY_LEN: usize = 32;

/// Error returned when uploaded key material fails validation.
#[derive(Debug, thiserror::Error)]
pub enum KeyValidationError {
    #[error("Key is not valid base64: {0}")]
    NotBase64(String),
    #[error("Key has wrong length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// Validate that a string is valid base64 and decodes to exactly `expected_len` bytes.
pub fn validate_key_bytes(
    encoded: &str,
    expected_len: usize,
    label: &str,
) -> Result<Vec<u8>, KeyValidationError> {
    let bytes = B64
        .decode(encoded)
        .map_err(|_| KeyValidationError::NotBase64(label.to_owned()))?;
    if bytes.len() != expected_len {
        return Err(KeyValidationError::WrongLength {
            expected: expected_len,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Validate a public identity key (32 bytes, base64-encoded).
pub fn validate_identity_key(encoded: &str) -> Result<Vec<u8>, KeyValidationError> {
    validate_key_bytes(encoded, PUBLIC_KEY_LEN, "identity_key")
}

/// Pre-key blobs are opaque to the server but must at least be base64.
pub fn validate_prekey_blob(encoded: &str, label: &str) -> Result<(), KeyValidationError> {
    B64.decode(encoded)
        .map(|_| ())
        .map_err(|_| KeyValidationError::NotBase64(label.to_owned()))
}

/// Constant-time equality over strings. Used for OTP codes, HMAC hex digests,
/// and anything else an attacker could time.
pub fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_round_trip() {
        let encoded = B64.encode([7u8; 32]);
        assert_eq!(validate_identity_key(&encoded).unwrap().len(), 32);
    }

    #[test]
    fn identity_key_bad_length() {
        let short = B64.encode([0u8; 16]);
        assert!(validate_identity_key(&short).is_err());
    }

    #[test]
    fn ct_eq_differs_on_length_and_content() {
        assert!(ct_eq("12345", "12345"));
        assert!(!ct_eq("12345", "12346"));
        assert!(!ct_eq("12345", "1234"));
    }
}
