//! Media token minting — short-lived signed bearer tokens for the external
//! real-time media service, plus the ICE-server configuration built from the
//! same keys.
//!
//! The media path itself lives elsewhere; this server only authorizes rooms.
//! TURN credentials follow the long-lived shared-secret REST scheme:
//! `username = "{expiry_unix}:{subject}"`,
//! `credential = base64(HMAC-SHA1(turn_secret, username))`.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, Duration, Utc};
use crest_common::config::MediaConfig;
use crest_common::error::{CrestError, CrestResult};
use hmac::{Hmac, Mac};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use uuid::Uuid;

type HmacSha1 = Hmac<Sha1>;

/// Hard ceiling on room-token validity.
const MAX_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Grants carried inside a room token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomGrants {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
    /// Owners administer the room
    pub room_admin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct MediaClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
    jti: String,
    /// Display label shown to other participants
    name: String,
    video: RoomGrants,
}

/// One ICE server entry, shaped for RTCPeerConnection configuration.
#[derive(Debug, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MintedRoomToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct MediaTokenMinter {
    issuer: String,
    encoding: EncodingKey,
    stun_urls: Vec<String>,
    turn_host: String,
    turn_secret: String,
    turn_credential_ttl: Duration,
    token_ttl: Duration,
}

impl MediaTokenMinter {
    pub fn new(issuer: &str, signing_key: &str, config: &MediaConfig) -> Self {
        Self {
            issuer: issuer.to_string(),
            encoding: EncodingKey::from_secret(signing_key.as_bytes()),
            stun_urls: config
                .stun_urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            turn_host: config.turn_host.clone(),
            turn_secret: config.turn_secret.clone(),
            turn_credential_ttl: Duration::seconds(config.turn_credential_ttl_secs),
            token_ttl: Duration::seconds(config.token_ttl_secs.min(MAX_TOKEN_TTL_SECS)),
        }
    }

    /// Mint a signed bearer token authorizing one room on the media service.
    pub fn mint_room_token(
        &self,
        subject_user: Uuid,
        display_name: &str,
        room_id: &str,
        can_publish: bool,
        can_subscribe: bool,
        is_owner: bool,
    ) -> CrestResult<MintedRoomToken> {
        let now = Utc::now();
        let expires_at = now + self.token_ttl;
        let claims = MediaClaims {
            iss: self.issuer.clone(),
            sub: subject_user.to_string(),
            aud: "crest:media".to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            name: display_name.to_string(),
            video: RoomGrants {
                room: room_id.to_string(),
                room_join: true,
                can_publish,
                can_subscribe,
                can_publish_data: true,
                room_admin: is_owner,
            },
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| CrestError::Internal(e.into()))?;
        Ok(MintedRoomToken { token, expires_at })
    }

    /// ICE configuration for peer setup: the configured STUN servers plus,
    /// when a relay is configured, TURN entries with REST credentials.
    pub fn ice_servers(&self, subject_user: Uuid) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_host.is_empty() {
            let expiry = (Utc::now() + self.turn_credential_ttl).timestamp();
            let username = format!("{expiry}:{subject_user}");
            let mut mac = HmacSha1::new_from_slice(self.turn_secret.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(username.as_bytes());
            let credential = B64.encode(mac.finalize().into_bytes());
            servers.push(IceServer {
                urls: vec![
                    format!("turn:{}:3478?transport=udp", self.turn_host),
                    format!("turns:{}:5349?transport=tcp", self.turn_host),
                ],
                username: Some(username),
                credential: Some(credential),
            });
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};

    fn minter() -> MediaTokenMinter {
        MediaTokenMinter::new(
            "crest.test",
            "media-signing-key",
            &MediaConfig {
                stun_urls: "stun:stun.example.org:3478".into(),
                turn_host: "turn.example.org".into(),
                turn_secret: "turn-secret".into(),
                turn_credential_ttl_secs: 3600,
                token_ttl_secs: 7200,
            },
        )
    }

    #[test]
    fn room_token_carries_grants_and_expiry() {
        let m = minter();
        let user = Uuid::new_v4();
        let minted = m
            .mint_room_token(user, "Dana", "channel-7", true, true, true)
            .unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["crest:media"]);
        let claims = decode::<MediaClaims>(
            &minted.token,
            &DecodingKey::from_secret(b"media-signing-key"),
            &validation,
        )
        .unwrap()
        .claims;

        assert_eq!(claims.sub, user.to_string());
        assert_eq!(claims.video.room, "channel-7");
        assert!(claims.video.room_join && claims.video.room_admin);
        assert!(claims.exp - claims.iat <= MAX_TOKEN_TTL_SECS);
    }

    #[test]
    fn token_ttl_is_capped_at_a_day() {
        let m = MediaTokenMinter::new(
            "crest.test",
            "k",
            &MediaConfig {
                stun_urls: String::new(),
                turn_host: String::new(),
                turn_secret: String::new(),
                turn_credential_ttl_secs: 3600,
                token_ttl_secs: 999_999,
            },
        );
        let minted = m
            .mint_room_token(Uuid::new_v4(), "n", "r", false, true, false)
            .unwrap();
        assert!(minted.expires_at <= Utc::now() + Duration::seconds(MAX_TOKEN_TTL_SECS + 5));
    }

    #[test]
    fn ice_config_includes_turn_rest_credentials() {
        let m = minter();
        let servers = m.ice_servers(Uuid::new_v4());
        assert_eq!(servers.len(), 2);
        let turn = &servers[1];
        assert!(turn.urls[0].starts_with("turn:turn.example.org"));
        let username = turn.username.as_ref().unwrap();
        assert!(username.contains(':'));
        assert!(turn.credential.is_some());
    }
}
