//! Credential broker — the protocol adapter around public-key
//! attestation/assertion ceremonies.
//!
//! The ceremony mechanics (challenge minting, COSE verification, signature
//! checks) are delegated to webauthn-rs. This module owns what the protocol
//! library cannot know about our deployment:
//!
//! - the [`AcceptedOrigin`] split: a domain-derived HTTPS origin
//!   (reverse-proxy aware, from `server.public_url`) and the
//!   platform-specific app-identity origins accepted verbatim by prefix.
//!   The two never mix; an app origin is never parsed into the HTTPS branch.
//! - structured pre-checks over the client data so callers get
//!   `OriginMismatch` / `ChallengeMismatch` instead of one opaque failure.
//! - in-memory, one-shot ceremony state with a five-minute lifetime.
//! - the guarantee that stored transports always include `"hybrid"` so
//!   cross-device resumption stays possible.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::user::StoredCredential;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, CredentialID, Passkey, PasskeyAuthentication, PasskeyRegistration,
    PublicKeyCredential, RegisterPublicKeyCredential, RequestChallengeResponse, Url, Webauthn,
    WebauthnBuilder,
};

/// Ceremony state lifetime.
const CEREMONY_TTL: Duration = Duration::minutes(5);

/// An origin the broker is willing to accept during verification.
///
/// Kept as two disjoint variants on purpose: the HTTPS branch is derived
/// from configuration and compared structurally, the app-identity branch is
/// matched verbatim by prefix and never URL-normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptedOrigin {
    Https(Url),
    AppIdentity(String),
}

enum Ceremony {
    Registration {
        user_id: Uuid,
        state: PasskeyRegistration,
        challenge: String,
    },
    Authentication {
        state: PasskeyAuthentication,
        challenge: String,
    },
}

struct Pending {
    ceremony: Ceremony,
    expires_at: DateTime<Utc>,
}

/// Slice of the authenticator's client data the broker pre-checks.
#[derive(Debug, Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    type_: String,
    challenge: String,
    origin: String,
}

pub struct CredentialBroker {
    webauthn: Webauthn,
    https_origin: Url,
    app_origin_prefixes: Vec<String>,
    ceremonies: Mutex<HashMap<String, Pending>>,
}

impl CredentialBroker {
    /// Build from the deployment's public URL and app-identity prefixes.
    pub fn new(public_url: &str, rp_id: &str, rp_name: &str, app_origins: &[String]) -> anyhow::Result<Self> {
        let https_origin = Url::parse(public_url)?;
        let mut builder = WebauthnBuilder::new(rp_id, &https_origin)?.rp_name(rp_name);
        for origin in app_origins {
            match Url::parse(origin) {
                Ok(url) => builder = builder.append_allowed_origin(&url),
                Err(e) => {
                    tracing::warn!(origin, error = %e, "app origin is not URL-shaped; prefix matching only")
                }
            }
        }
        Ok(Self {
            webauthn: builder.build()?,
            https_origin,
            app_origin_prefixes: app_origins.to_vec(),
            ceremonies: Mutex::new(HashMap::new()),
        })
    }

    /// Classify an origin presented by an authenticator.
    pub fn classify_origin(&self, origin: &str) -> CrestResult<AcceptedOrigin> {
        // App-identity first: these are opaque strings, never URLs to us.
        if self
            .app_origin_prefixes
            .iter()
            .any(|prefix| origin.starts_with(prefix.as_str()))
        {
            return Ok(AcceptedOrigin::AppIdentity(origin.to_string()));
        }

        let presented = Url::parse(origin).map_err(|_| CrestError::OriginMismatch)?;
        let matches = presented.scheme() == self.https_origin.scheme()
            && presented.host_str() == self.https_origin.host_str()
            && presented.port_or_known_default() == self.https_origin.port_or_known_default();
        if matches {
            Ok(AcceptedOrigin::Https(presented))
        } else {
            Err(CrestError::OriginMismatch)
        }
    }

    fn store_ceremony(&self, ceremony: Ceremony) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut map = self.ceremonies.lock().expect("ceremony map poisoned");
        map.retain(|_, pending| pending.expires_at > now);
        map.insert(
            id.clone(),
            Pending {
                ceremony,
                expires_at: now + CEREMONY_TTL,
            },
        );
        id
    }

    fn take_ceremony(&self, challenge_id: &str) -> CrestResult<Ceremony> {
        let mut map = self.ceremonies.lock().expect("ceremony map poisoned");
        let pending = map.remove(challenge_id).ok_or(CrestError::ChallengeMismatch)?;
        if pending.expires_at <= Utc::now() {
            return Err(CrestError::ChallengeMismatch);
        }
        Ok(pending.ceremony)
    }

    fn precheck(
        &self,
        client_data_json: &[u8],
        expected_type: &str,
        expected_challenge: &str,
    ) -> CrestResult<AcceptedOrigin> {
        let data: ClientData =
            serde_json::from_slice(client_data_json).map_err(|_| CrestError::CredentialInvalid)?;
        if data.type_ != expected_type {
            return Err(CrestError::CredentialInvalid);
        }
        if data.challenge != expected_challenge {
            return Err(CrestError::ChallengeMismatch);
        }
        self.classify_origin(&data.origin)
    }

    // ============================================================
    // Registration (attestation)
    // ============================================================

    /// Open a registration ceremony. Returns the options to relay to the
    /// authenticator and the one-shot challenge id.
    pub fn start_registration(
        &self,
        user_id: Uuid,
        address: &str,
        existing: &[StoredCredential],
    ) -> CrestResult<(CreationChallengeResponse, String)> {
        let exclude: Vec<CredentialID> = existing
            .iter()
            .filter_map(|c| URL_SAFE_NO_PAD.decode(&c.id).ok())
            .map(CredentialID::from)
            .collect();

        let (ccr, state) = self
            .webauthn
            .start_passkey_registration(user_id, address, address, Some(exclude))
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to open registration ceremony");
                CrestError::CredentialInvalid
            })?;

        let challenge = URL_SAFE_NO_PAD.encode(ccr.public_key.challenge.as_ref());
        let challenge_id = self.store_ceremony(Ceremony::Registration {
            user_id,
            state,
            challenge,
        });
        Ok((ccr, challenge_id))
    }

    /// Close a registration ceremony and produce the credential record to
    /// append to the user row.
    pub fn finish_registration(
        &self,
        challenge_id: &str,
        attestation: &RegisterPublicKeyCredential,
        ip: Option<&str>,
        location: Option<&str>,
    ) -> CrestResult<(Uuid, StoredCredential)> {
        let Ceremony::Registration {
            user_id,
            state,
            challenge,
        } = self.take_ceremony(challenge_id)?
        else {
            return Err(CrestError::ChallengeMismatch);
        };

        self.precheck(
            attestation.response.client_data_json.as_ref(),
            "webauthn.create",
            &challenge,
        )?;

        let passkey = self
            .webauthn
            .finish_passkey_registration(attestation, &state)
            .map_err(|e| {
                tracing::warn!(error = %e, "attestation verification failed");
                CrestError::CredentialInvalid
            })?;

        let credential_id = URL_SAFE_NO_PAD.encode(passkey.cred_id().as_ref());
        let public_key = serde_json::to_value(&passkey)
            .map_err(|e| CrestError::Internal(e.into()))?;

        // Declared transports, with "hybrid" guaranteed so a phone can
        // resume this credential against a new device.
        let mut transports: Vec<String> = attestation
            .response
            .transports
            .as_ref()
            .map(|ts| {
                ts.iter()
                    .filter_map(|t| {
                        serde_json::to_value(t)
                            .ok()
                            .and_then(|v| v.as_str().map(String::from))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !transports.iter().any(|t| t == "hybrid") {
            transports.push("hybrid".to_string());
        }

        Ok((
            user_id,
            StoredCredential {
                id: credential_id,
                public_key,
                transports,
                created_at: Utc::now(),
                last_login: None,
                ip: ip.map(String::from),
                location: location.map(String::from),
            },
        ))
    }

    // ============================================================
    // Authentication (assertion)
    // ============================================================

    /// Open an assertion ceremony over a user's enrolled credentials.
    pub fn start_authentication(
        &self,
        credentials: &[StoredCredential],
    ) -> CrestResult<(RequestChallengeResponse, String)> {
        let passkeys: Vec<Passkey> = credentials
            .iter()
            .filter_map(|c| serde_json::from_value(c.public_key.clone()).ok())
            .collect();
        if passkeys.is_empty() {
            return Err(CrestError::NoCredentialsEnrolled);
        }

        let (rcr, state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to open assertion ceremony");
                CrestError::CredentialInvalid
            })?;

        let challenge = URL_SAFE_NO_PAD.encode(rcr.public_key.challenge.as_ref());
        let challenge_id = self.store_ceremony(Ceremony::Authentication { state, challenge });
        Ok((rcr, challenge_id))
    }

    /// Close an assertion ceremony. Returns the id of the credential that
    /// signed, which callers use to update stored metadata.
    pub fn finish_authentication(
        &self,
        challenge_id: &str,
        assertion: &PublicKeyCredential,
        credentials: &[StoredCredential],
    ) -> CrestResult<String> {
        let Ceremony::Authentication { state, challenge } = self.take_ceremony(challenge_id)?
        else {
            return Err(CrestError::ChallengeMismatch);
        };

        self.precheck(
            assertion.response.client_data_json.as_ref(),
            "webauthn.get",
            &challenge,
        )?;

        let presented_id = URL_SAFE_NO_PAD.encode(assertion.raw_id.as_ref());
        if !credentials.iter().any(|c| c.id == presented_id) {
            return Err(CrestError::CredentialUnknown);
        }

        self.webauthn
            .finish_passkey_authentication(assertion, &state)
            .map_err(|e| {
                tracing::warn!(error = %e, "assertion verification failed");
                CrestError::CredentialInvalid
            })?;

        Ok(presented_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> CredentialBroker {
        CredentialBroker::new(
            "https://crest.test",
            "crest.test",
            "Crest",
            &["android:apk-key-hash:".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn https_origin_matches_structurally() {
        let b = broker();
        assert!(matches!(
            b.classify_origin("https://crest.test"),
            Ok(AcceptedOrigin::Https(_))
        ));
        // 443 is implied for https.
        assert!(matches!(
            b.classify_origin("https://crest.test:443"),
            Ok(AcceptedOrigin::Https(_))
        ));
        assert!(matches!(
            b.classify_origin("https://evil.test"),
            Err(CrestError::OriginMismatch)
        ));
        assert!(matches!(
            b.classify_origin("http://crest.test"),
            Err(CrestError::OriginMismatch)
        ));
    }

    #[test]
    fn app_identity_origin_passes_verbatim() {
        let b = broker();
        match b.classify_origin("android:apk-key-hash:dGVzdA") {
            Ok(AcceptedOrigin::AppIdentity(s)) => {
                assert_eq!(s, "android:apk-key-hash:dGVzdA");
            }
            other => panic!("expected AppIdentity, got {other:?}"),
        }
        assert!(matches!(
            b.classify_origin("ios:bundle-id:com.example"),
            Err(CrestError::OriginMismatch)
        ));
    }

    #[test]
    fn unknown_challenge_id_mismatches() {
        let b = broker();
        let err = b.take_ceremony("nope").map(|_| ()).unwrap_err();
        assert!(matches!(err, CrestError::ChallengeMismatch));
    }
}
