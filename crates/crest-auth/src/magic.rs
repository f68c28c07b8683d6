//! Magic links — single-shot login tokens delivered out-of-band.
//!
//! Wire format, exactly four `|`-separated fields:
//!
//! ```text
//! {server_url}|{random_32B_hex}|{timestamp_ms}|{hmac_hex}
//! ```
//!
//! The HMAC-SHA256 is computed over `{server_url}|{random}|{timestamp}` with
//! the server signing key, hex-lowercased. The random value doubles as the
//! lookup key in the in-memory link map. Links live five minutes and are
//! consumed on first successful verification. A signature mismatch is
//! rejected before the map is ever touched. Restart invalidates in-flight
//! links; that is accepted behavior.

use chrono::{DateTime, Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_common::keys::ct_eq;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
struct LinkEntry {
    address: String,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
    used: bool,
}

/// Identity a verified magic link resolves to.
#[derive(Debug, Clone)]
pub struct MagicIdentity {
    pub address: String,
    pub user_id: Uuid,
}

pub struct MagicLinkService {
    server_url: String,
    signing_key: Vec<u8>,
    ttl: Duration,
    links: Mutex<HashMap<String, LinkEntry>>,
}

impl MagicLinkService {
    pub fn new(server_url: &str, signing_key: &str, ttl_secs: i64) -> Self {
        Self {
            server_url: server_url.to_string(),
            signing_key: signing_key.as_bytes().to_vec(),
            ttl: Duration::seconds(ttl_secs),
            links: Mutex::new(HashMap::new()),
        }
    }

    fn sign(&self, server_url: &str, random_hex: &str, timestamp_ms: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{server_url}|{random_hex}|{timestamp_ms}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Mint a link for a user. The returned string is the full token.
    pub fn generate(&self, address: &str, user_id: Uuid) -> String {
        let mut random = [0u8; 32];
        rand::rng().fill_bytes(&mut random);
        let random_hex = hex::encode(random);

        let now = Utc::now();
        let timestamp_ms = now.timestamp_millis();
        let signature = self.sign(&self.server_url, &random_hex, timestamp_ms);

        let mut links = self.links.lock().expect("magic link map poisoned");
        links.retain(|_, entry| entry.expires_at > now); // opportunistic sweep
        links.insert(
            random_hex.clone(),
            LinkEntry {
                address: address.to_string(),
                user_id,
                expires_at: now + self.ttl,
                used: false,
            },
        );

        format!("{}|{}|{}|{}", self.server_url, random_hex, timestamp_ms, signature)
    }

    /// Verify and consume a link. One-shot: the second successful parse of
    /// the same token yields [`CrestError::TokenRevoked`].
    pub fn verify(&self, token: &str) -> CrestResult<MagicIdentity> {
        let fields: Vec<&str> = token.split('|').collect();
        let [server_url, random_hex, timestamp_str, signature] = fields[..] else {
            return Err(CrestError::TokenInvalid);
        };

        let timestamp_ms: i64 = timestamp_str.parse().map_err(|_| CrestError::TokenInvalid)?;

        // Signature check comes first: tampered tokens never touch the map.
        let expected = self.sign(server_url, random_hex, timestamp_ms);
        if !ct_eq(&expected, signature) {
            return Err(CrestError::TokenInvalid);
        }
        if server_url != self.server_url {
            return Err(CrestError::TokenInvalid);
        }

        let mut links = self.links.lock().expect("magic link map poisoned");
        let entry = links.get_mut(random_hex).ok_or(CrestError::TokenInvalid)?;
        if entry.used {
            return Err(CrestError::TokenRevoked);
        }
        if entry.expires_at <= Utc::now() {
            return Err(CrestError::TokenExpired);
        }
        entry.used = true;
        Ok(MagicIdentity {
            address: entry.address.clone(),
            user_id: entry.user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MagicLinkService {
        MagicLinkService::new("https://crest.test", "test-signing-key", 300)
    }

    #[test]
    fn verify_round_trip_then_revoked() {
        let svc = service();
        let user = Uuid::new_v4();
        let token = svc.generate("a@example.com", user);

        let identity = svc.verify(&token).unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.address, "a@example.com");

        // One-shot: second use is revoked.
        assert!(matches!(svc.verify(&token), Err(CrestError::TokenRevoked)));
    }

    #[test]
    fn tampered_timestamp_is_invalid_without_consuming() {
        let svc = service();
        let token = svc.generate("a@example.com", Uuid::new_v4());

        let mut fields: Vec<String> = token.split('|').map(String::from).collect();
        let bumped: i64 = fields[2].parse::<i64>().unwrap() + 1;
        fields[2] = bumped.to_string();
        let tampered = fields.join("|");

        assert!(matches!(svc.verify(&tampered), Err(CrestError::TokenInvalid)));
        // The untampered token still works: the map was never touched.
        assert!(svc.verify(&token).is_ok());
    }

    #[test]
    fn wrong_field_count_is_invalid() {
        let svc = service();
        assert!(matches!(svc.verify("a|b|c"), Err(CrestError::TokenInvalid)));
        assert!(matches!(svc.verify("a|b|c|d|e"), Err(CrestError::TokenInvalid)));
    }
}
