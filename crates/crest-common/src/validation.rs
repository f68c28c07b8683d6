//! Input validation utilities.
//!
//! Centralized validation helpers used across API routes, plus the address
//! normalization and suffix policy applied at enrollment.

use validator::Validate;

use crate::error::CrestError;

/// Validate a request body, returning a CrestError::Validation on failure.
pub fn validate_request<T: Validate>(body: &T) -> Result<(), CrestError> {
    body.validate().map_err(|e| CrestError::Validation {
        message: format_validation_errors(e),
    })
}

/// Format validation errors into a human-readable string.
fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for '{field}'"))
            })
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Normalize an address for storage and lookup: trimmed, lowercased.
/// Addresses are case-insensitive-unique.
pub fn normalize_address(address: &str) -> Result<String, CrestError> {
    let addr = address.trim().to_lowercase();
    let valid = addr.len() >= 3
        && addr.len() <= 254
        && addr.split_once('@').is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        });
    if !valid {
        return Err(CrestError::InvalidAddress);
    }
    Ok(addr)
}

/// Enforce the server's address-suffix policy. An empty allow-list admits
/// every address.
pub fn check_address_policy(address: &str, allowed_suffixes: &[String]) -> Result<(), CrestError> {
    if allowed_suffixes.is_empty() {
        return Ok(());
    }
    if allowed_suffixes
        .iter()
        .any(|s| address.ends_with(&s.to_lowercase()))
    {
        return Ok(());
    }
    Err(CrestError::PolicyRefused(
        "address not permitted on this server".into(),
    ))
}

/// Validate that a string is a safe channel name.
pub fn validate_name(name: &str) -> Result<(), CrestError> {
    if name.trim().is_empty() {
        return Err(CrestError::Validation {
            message: "Name cannot be empty or whitespace only".into(),
        });
    }
    let valid = name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ' ');
    if !valid {
        return Err(CrestError::Validation {
            message: "Name can only contain letters, numbers, hyphens, underscores, and spaces"
                .into(),
        });
    }
    Ok(())
}

/// Validate a display or short handle (shown to other users).
pub fn validate_handle(handle: &str) -> Result<(), CrestError> {
    if handle.trim().is_empty() {
        return Err(CrestError::Validation {
            message: "Handle cannot be empty or whitespace only".into(),
        });
    }
    if handle.len() > 64 {
        return Err(CrestError::Validation {
            message: "Handle must be at most 64 characters".into(),
        });
    }
    let valid = handle
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' || c == '.');
    if !valid {
        return Err(CrestError::Validation {
            message: "Handle can only contain letters, numbers, hyphens, underscores, dots, and spaces"
                .into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_lowercased() {
        assert_eq!(normalize_address(" A@Example.COM ").unwrap(), "a@example.com");
    }

    #[test]
    fn bad_addresses_rejected() {
        assert!(normalize_address("nope").is_err());
        assert!(normalize_address("@example.com").is_err());
        assert!(normalize_address("a@nodot").is_err());
    }

    #[test]
    fn suffix_policy() {
        let allowed = vec!["@corp.example".to_string()];
        assert!(check_address_policy("dev@corp.example", &allowed).is_ok());
        assert!(check_address_policy("dev@gmail.com", &allowed).is_err());
        assert!(check_address_policy("dev@gmail.com", &[]).is_ok());
    }
}
