//! Session manager — browser cookie sessions and native HMAC sessions.
//!
//! Cookie sessions are opaque server-side rows addressed by the cookie
//! value. HMAC sessions give native clients a per-device symmetric secret;
//! every request carries `client_handle`, a millisecond timestamp, a random
//! nonce, and
//! `HMAC_SHA256(secret, handle:timestamp:nonce:path:body)` hex-encoded.
//! Verification enforces, in order: freshness (±5 min), nonce novelty,
//! session existence and expiry, the signature itself (constant time), and
//! that the backing user is still active.

use chrono::{DateTime, Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_common::keys::ct_eq;
use crest_common::models::session::{CookieSession, HmacSession};
use crest_db::Database;
use crest_db::repository::{sessions, users};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;

use crate::nonce::NonceCache;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew between client and server, inclusive.
const FRESHNESS_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Everything a native client needs to sign requests. The secret appears
/// here once and never again.
#[derive(Debug, serde::Serialize)]
pub struct MintedHmacSession {
    pub client_handle: String,
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionManager {
    db: Database,
    nonces: Arc<NonceCache>,
    cookie_lifetime: Duration,
    hmac_lifetime: Duration,
}

impl SessionManager {
    pub fn new(
        db: Database,
        nonces: Arc<NonceCache>,
        cookie_hours: i64,
        hmac_days: i64,
    ) -> Self {
        Self {
            db,
            nonces,
            cookie_lifetime: Duration::hours(cookie_hours),
            hmac_lifetime: Duration::days(hmac_days),
        }
    }

    pub fn hmac_lifetime(&self) -> Duration {
        self.hmac_lifetime
    }

    // ============================================================
    // Cookie sessions
    // ============================================================

    /// Create an anonymous cookie session row. The returned id goes into an
    /// HttpOnly cookie.
    pub async fn create_cookie_session(&self) -> CrestResult<CookieSession> {
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        let id = hex::encode(raw);
        let expires_at = Utc::now() + self.cookie_lifetime;

        self.db
            .writer
            .enqueue("cookie-session-create", move |pool| async move {
                sessions::create_cookie(&pool, &id, expires_at)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await
    }

    /// Load a cookie session, rejecting expired rows.
    pub async fn load_cookie_session(&self, id: &str) -> CrestResult<CookieSession> {
        let session = sessions::find_cookie(&self.db.pool, id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::NoSession)?;
        if session.expires_at <= Utc::now() {
            return Err(CrestError::SessionExpired);
        }
        Ok(session)
    }

    /// Slide the cookie session's expiry forward.
    pub async fn extend_cookie_session(&self, id: &str) -> CrestResult<()> {
        let id = id.to_string();
        let expires_at = Utc::now() + self.cookie_lifetime;
        self.db
            .writer
            .enqueue("cookie-session-extend", move |pool| async move {
                sessions::extend_cookie(&pool, &id, expires_at)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await
    }

    /// Destroy a cookie session (logout).
    pub async fn destroy_cookie_session(&self, id: &str) -> CrestResult<()> {
        let id = id.to_string();
        self.db
            .writer
            .enqueue("cookie-session-destroy", move |pool| async move {
                sessions::delete_cookie(&pool, &id)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await
    }

    // ============================================================
    // HMAC sessions
    // ============================================================

    /// Mint (or replace) the HMAC session for a device. The secret is
    /// returned exactly once.
    pub async fn mint_hmac_session(
        &self,
        client_handle: &str,
        user_id: uuid::Uuid,
        device_id: i64,
        device_info: Option<&str>,
    ) -> CrestResult<MintedHmacSession> {
        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        let secret = hex::encode(raw);

        let handle = client_handle.to_string();
        let info = device_info.map(String::from);
        let stored_secret = secret.clone();
        let expires_at = Utc::now() + self.hmac_lifetime;

        let session = self
            .db
            .writer
            .enqueue("hmac-session-mint", move |pool| async move {
                sessions::upsert_hmac(
                    &pool,
                    &handle,
                    user_id,
                    device_id,
                    &stored_secret,
                    info.as_deref(),
                    expires_at,
                )
                .await
                .map_err(CrestError::Internal)
            })
            .await?;

        Ok(MintedHmacSession {
            client_handle: session.client_handle,
            secret,
            expires_at: session.expires_at,
        })
    }

    /// The canonical string a client signs for one request.
    pub fn canonical_request(
        client_handle: &str,
        timestamp_ms: i64,
        nonce: &str,
        path: &str,
        body: &str,
    ) -> String {
        format!("{client_handle}:{timestamp_ms}:{nonce}:{path}:{body}")
    }

    /// Compute the expected signature for a request, hex-lowercased.
    pub fn sign_request(
        secret_hex: &str,
        client_handle: &str,
        timestamp_ms: i64,
        nonce: &str,
        path: &str,
        body: &str,
    ) -> CrestResult<String> {
        let key = hex::decode(secret_hex).map_err(|_| CrestError::InvalidSignature)?;
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC accepts keys of any length");
        mac.update(Self::canonical_request(client_handle, timestamp_ms, nonce, path, body).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Full per-request verification. On success bumps `last_used` and
    /// returns the session row.
    pub async fn verify_hmac_request(
        &self,
        client_handle: &str,
        timestamp_ms: i64,
        nonce: &str,
        signature: &str,
        path: &str,
        body: &str,
    ) -> CrestResult<HmacSession> {
        let now_ms = Utc::now().timestamp_millis();
        if (now_ms - timestamp_ms).abs() > FRESHNESS_WINDOW_MS {
            return Err(CrestError::RequestExpired);
        }

        if self.nonces.contains(nonce) {
            return Err(CrestError::DuplicateNonce);
        }

        let session = sessions::find_hmac(&self.db.pool, client_handle)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::NoSession)?;
        if session.expires_at <= Utc::now() {
            return Err(CrestError::SessionExpired);
        }

        let expected = Self::sign_request(
            &session.secret,
            client_handle,
            timestamp_ms,
            nonce,
            path,
            body,
        )?;
        if !ct_eq(&expected, &signature.to_lowercase()) {
            return Err(CrestError::InvalidSignature);
        }

        let user = users::find_by_id(&self.db.pool, session.user_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserMissing)?;
        if !user.active {
            return Err(CrestError::UserInactive);
        }

        // Last gate: the race between two identical in-flight requests is
        // settled here.
        if !self.nonces.insert_if_absent(nonce) {
            return Err(CrestError::DuplicateNonce);
        }

        let handle = client_handle.to_string();
        self.db.writer.enqueue_detached("hmac-last-used", move |pool| async move {
            sessions::bump_hmac_last_used(&pool, &handle)
                .await
                .map_err(CrestError::Internal)
        });

        Ok(session)
    }

    /// Extend an HMAC session by the configured lifetime. Gated by the
    /// verifier itself at the route layer.
    pub async fn refresh_hmac_session(&self, client_handle: &str) -> CrestResult<DateTime<Utc>> {
        let handle = client_handle.to_string();
        let expires_at = Utc::now() + self.hmac_lifetime;
        self.db
            .writer
            .enqueue("hmac-session-refresh", move |pool| async move {
                sessions::extend_hmac(&pool, &handle, expires_at)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(expires_at)
            })
            .await
    }

    /// Drop the HMAC session for a handle (logout / device removal).
    pub async fn revoke_hmac_session(&self, client_handle: &str) -> CrestResult<()> {
        let handle = client_handle.to_string();
        self.db
            .writer
            .enqueue("hmac-session-revoke", move |pool| async move {
                sessions::delete_hmac(&pool, &handle)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crest_db::repository::devices;

    async fn seeded() -> (Database, SessionManager, uuid::Uuid) {
        let db = Database::connect_in_memory().await.unwrap();
        let user = users::create_if_absent(&db.pool, "s@example.com").await.unwrap();
        devices::create(&db.pool, user.id, "native-1", None, None, None)
            .await
            .unwrap();
        let mgr = SessionManager::new(db.clone(), Arc::new(NonceCache::new()), 24, 90);
        (db, mgr, user.id)
    }

    fn signed_parts(
        minted: &MintedHmacSession,
        nonce: &str,
        ts: i64,
    ) -> (String, String) {
        let sig = SessionManager::sign_request(
            &minted.secret,
            &minted.client_handle,
            ts,
            nonce,
            "/api/v1/messages",
            "{}",
        )
        .unwrap();
        (nonce.to_string(), sig)
    }

    #[tokio::test]
    async fn hmac_round_trip_and_replay() {
        let (_db, mgr, user_id) = seeded().await;
        let minted = mgr
            .mint_hmac_session("native-1", user_id, 1, Some("test agent"))
            .await
            .unwrap();

        let ts = Utc::now().timestamp_millis();
        let (nonce, sig) = signed_parts(&minted, "nonce-aaaa", ts);

        let session = mgr
            .verify_hmac_request("native-1", ts, &nonce, &sig, "/api/v1/messages", "{}")
            .await
            .unwrap();
        assert_eq!(session.user_id, user_id);
        assert_eq!(session.device_id, 1);

        // Byte-identical replay inside the window: rejected on the nonce.
        assert!(matches!(
            mgr.verify_hmac_request("native-1", ts, &nonce, &sig, "/api/v1/messages", "{}")
                .await,
            Err(CrestError::DuplicateNonce)
        ));

        // Fresh nonce, new signature: accepted.
        let (nonce2, sig2) = signed_parts(&minted, "nonce-bbbb", ts);
        assert!(
            mgr.verify_hmac_request("native-1", ts, &nonce2, &sig2, "/api/v1/messages", "{}")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn freshness_window_boundary() {
        let (_db, mgr, user_id) = seeded().await;
        let minted = mgr
            .mint_hmac_session("native-1", user_id, 1, None)
            .await
            .unwrap();

        // Skew right at the edge of the window is accepted. A one-second
        // margin keeps the assertion stable against the wall clock moving
        // between building and verifying the request.
        let ts = Utc::now().timestamp_millis() - FRESHNESS_WINDOW_MS + 1_000;
        let (nonce, sig) = signed_parts(&minted, "nonce-edge", ts);
        assert!(
            mgr.verify_hmac_request("native-1", ts, &nonce, &sig, "/api/v1/messages", "{}")
                .await
                .is_ok()
        );

        // Past the window is not.
        let stale = Utc::now().timestamp_millis() - FRESHNESS_WINDOW_MS - 1_000;
        let (nonce2, sig2) = signed_parts(&minted, "nonce-late", stale);
        assert!(matches!(
            mgr.verify_hmac_request("native-1", stale, &nonce2, &sig2, "/api/v1/messages", "{}")
                .await,
            Err(CrestError::RequestExpired)
        ));
    }

    #[tokio::test]
    async fn bad_signature_and_inactive_user() {
        let (db, mgr, user_id) = seeded().await;
        let minted = mgr
            .mint_hmac_session("native-1", user_id, 1, None)
            .await
            .unwrap();
        let ts = Utc::now().timestamp_millis();

        assert!(matches!(
            mgr.verify_hmac_request("native-1", ts, "n-1", &"0".repeat(64), "/p", "")
                .await,
            Err(CrestError::InvalidSignature)
        ));

        users::set_active(&db.pool, user_id, false).await.unwrap();
        let (nonce, sig) = signed_parts(&minted, "n-2", ts);
        assert!(matches!(
            mgr.verify_hmac_request("native-1", ts, &nonce, &sig, "/api/v1/messages", "{}")
                .await,
            Err(CrestError::UserInactive)
        ));
    }
}
