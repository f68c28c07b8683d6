//! Short-lived signed bearer tokens: invitations and auth hand-off.
//!
//! HS256 with the server signing key. Every token carries issuer, subject,
//! audience, issued-at, and not-after, plus flow-specific claims. One-shot
//! consumption is enforced through the server-side consumption set keyed by
//! the token id.

use chrono::{Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_db::Database;
use crest_db::repository::invites;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const AUD_INVITE: &str = "crest:invite";
const AUD_HANDOFF: &str = "crest:handoff";

/// Claims shared by every short-lived bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct BearerClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    /// Invitation: the address the invite is bound to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Hand-off: the credential enrolled in the embedded browser
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

pub struct TokenMinter {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenMinter {
    pub fn new(issuer: &str, signing_key: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            encoding: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding: DecodingKey::from_secret(signing_key.as_bytes()),
        }
    }

    fn mint(
        &self,
        aud: &str,
        sub: &str,
        jti: &str,
        ttl: Duration,
        address: Option<String>,
        credential_id: Option<String>,
    ) -> CrestResult<String> {
        let now = Utc::now();
        let claims = BearerClaims {
            iss: self.issuer.clone(),
            sub: sub.to_string(),
            aud: aud.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: jti.to_string(),
            address,
            credential_id,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| CrestError::Internal(e.into()))
    }

    fn verify(&self, token: &str, aud: &str) -> CrestResult<BearerClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[aud]);
        validation.set_issuer(&[&self.issuer]);
        decode::<BearerClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => CrestError::TokenExpired,
                _ => CrestError::TokenInvalid,
            })
    }

    // ============================================================
    // Invitations
    // ============================================================

    /// Mint an invitation token. The invite row carries the one-shot state;
    /// its id is the token's `jti`.
    pub fn mint_invite(
        &self,
        invite_id: Uuid,
        address: Option<&str>,
        ttl_hours: i64,
    ) -> CrestResult<String> {
        self.mint(
            AUD_INVITE,
            "enrollment",
            &invite_id.to_string(),
            Duration::hours(ttl_hours),
            address.map(String::from),
            None,
        )
    }

    /// Verify an invitation token's signature and shape. Row-level checks
    /// (used flag, expiry, address binding) happen against the invite row.
    pub fn verify_invite(&self, token: &str) -> CrestResult<(Uuid, Option<String>)> {
        let claims = self.verify(token, AUD_INVITE)?;
        let invite_id = claims.jti.parse().map_err(|_| CrestError::TokenInvalid)?;
        Ok((invite_id, claims.address))
    }

    // ============================================================
    // Auth hand-off
    // ============================================================

    /// Mint a hand-off token that carries a fresh credential enrollment
    /// across the embedded-browser boundary.
    pub fn mint_handoff(
        &self,
        user_id: Uuid,
        credential_id: &str,
        ttl_secs: i64,
    ) -> CrestResult<String> {
        self.mint(
            AUD_HANDOFF,
            &user_id.to_string(),
            &Uuid::new_v4().to_string(),
            Duration::seconds(ttl_secs),
            None,
            Some(credential_id.to_string()),
        )
    }

    /// Verify and *consume* a hand-off token. Second presentation of the
    /// same token fails with `TokenRevoked`.
    pub async fn redeem_handoff(&self, db: &Database, token: &str) -> CrestResult<(Uuid, String)> {
        let claims = self.verify(token, AUD_HANDOFF)?;
        let user_id: Uuid = claims.sub.parse().map_err(|_| CrestError::TokenInvalid)?;
        let credential_id = claims.credential_id.ok_or(CrestError::TokenInvalid)?;

        let jti = claims.jti.clone();
        let fresh = db
            .writer
            .enqueue("handoff-consume", move |pool| async move {
                invites::try_consume_token(&pool, &jti)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await?;
        if !fresh {
            return Err(CrestError::TokenRevoked);
        }
        Ok((user_id, credential_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_round_trip() {
        let minter = TokenMinter::new("crest.test", "k");
        let id = Uuid::new_v4();
        let token = minter.mint_invite(id, Some("a@example.com"), 72).unwrap();
        let (parsed, address) = minter.verify_invite(&token).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(address.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let minter = TokenMinter::new("crest.test", "k");
        let token = minter
            .mint_handoff(Uuid::new_v4(), "cred-1", 300)
            .unwrap();
        assert!(matches!(
            minter.verify_invite(&token),
            Err(CrestError::TokenInvalid)
        ));
    }

    #[tokio::test]
    async fn handoff_is_one_shot() {
        let db = Database::connect_in_memory().await.unwrap();
        let minter = TokenMinter::new("crest.test", "k");
        let user = Uuid::new_v4();
        let token = minter.mint_handoff(user, "cred-9", 300).unwrap();

        let (parsed_user, cred) = minter.redeem_handoff(&db, &token).await.unwrap();
        assert_eq!(parsed_user, user);
        assert_eq!(cred, "cred-9");

        assert!(matches!(
            minter.redeem_handoff(&db, &token).await,
            Err(CrestError::TokenRevoked)
        ));
    }
}
