//! Opaque refresh tokens with single-use rotation and reuse detection.
//!
//! Redeeming a token marks it used and mints a successor in one serialized
//! operation. Presenting an already-used token means the chain leaked
//! somewhere: every refresh token for that client handle is destroyed and
//! the caller gets `ChainCompromised`.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_db::Database;
use crest_db::repository::{invites, refresh_tokens};
use rand::RngCore;
use uuid::Uuid;

pub struct RefreshTokenStore {
    db: Database,
    lifetime: Duration,
}

impl RefreshTokenStore {
    pub fn new(db: Database, lifetime_days: i64) -> Self {
        Self {
            db,
            lifetime: Duration::days(lifetime_days),
        }
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 64];
        rand::rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Mint the first token of a chain.
    pub async fn issue(&self, client_handle: &str, user_id: Uuid) -> CrestResult<String> {
        let token = Self::random_token();
        let stored = token.clone();
        let handle = client_handle.to_string();
        let expires_at = Utc::now() + self.lifetime;

        self.db
            .writer
            .enqueue("refresh-issue", move |pool| async move {
                refresh_tokens::insert(&pool, &stored, &handle, user_id, 0, expires_at)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(())
            })
            .await?;
        Ok(token)
    }

    /// Redeem a token for its successor. Atomic: the old token is marked
    /// used and the new one inserted in the same serialized operation.
    pub async fn redeem(&self, token: &str) -> CrestResult<String> {
        let presented = token.to_string();
        let successor = Self::random_token();
        let minted = successor.clone();
        let lifetime = self.lifetime;

        self.db
            .writer
            .enqueue("refresh-redeem", move |pool| async move {
                let row = match refresh_tokens::find(&pool, &presented)
                    .await
                    .map_err(CrestError::Internal)?
                {
                    Some(row) => row,
                    None => {
                        // Distinguish a burnt chain's survivor from garbage:
                        // revoked tokens leave tombstones behind.
                        if invites::token_consumed(&pool, &presented)
                            .await
                            .map_err(CrestError::Internal)?
                        {
                            return Err(CrestError::ChainCompromised);
                        }
                        return Err(CrestError::TokenInvalid);
                    }
                };

                if row.used_at.is_some() {
                    // Reuse: someone replayed an already-rotated token.
                    // Burn the whole chain, leaving tombstones.
                    for token in refresh_tokens::list_chain(&pool, &row.client_handle)
                        .await
                        .map_err(CrestError::Internal)?
                    {
                        invites::try_consume_token(&pool, &token)
                            .await
                            .map_err(CrestError::Internal)?;
                    }
                    let purged = refresh_tokens::delete_chain(&pool, &row.client_handle)
                        .await
                        .map_err(CrestError::Internal)?;
                    tracing::warn!(
                        client_handle = %row.client_handle,
                        purged,
                        "refresh token reuse detected; chain revoked"
                    );
                    return Err(CrestError::ChainCompromised);
                }
                if row.expires_at <= Utc::now() {
                    return Err(CrestError::TokenExpired);
                }

                refresh_tokens::mark_used(&pool, &presented)
                    .await
                    .map_err(CrestError::Internal)?;
                refresh_tokens::insert(
                    &pool,
                    &minted,
                    &row.client_handle,
                    row.user_id,
                    row.rotation_count + 1,
                    Utc::now() + lifetime,
                )
                .await
                .map_err(CrestError::Internal)?;
                Ok(())
            })
            .await?;
        Ok(successor)
    }

    /// Drop every token for a client handle (logout / device removal).
    pub async fn revoke_chain(&self, client_handle: &str) -> CrestResult<()> {
        let handle = client_handle.to_string();
        self.db
            .writer
            .enqueue("refresh-revoke-chain", move |pool| async move {
                refresh_tokens::delete_chain(&pool, &handle)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crest_db::repository::{devices, users};

    async fn seeded() -> (Database, Uuid) {
        let db = Database::connect_in_memory().await.unwrap();
        let user = users::create_if_absent(&db.pool, "r@example.com").await.unwrap();
        devices::create(&db.pool, user.id, "handle-1", None, None, None)
            .await
            .unwrap();
        (db, user.id)
    }

    #[tokio::test]
    async fn rotation_chain_advances() {
        let (db, user_id) = seeded().await;
        let store = RefreshTokenStore::new(db.clone(), 60);

        let t0 = store.issue("handle-1", user_id).await.unwrap();
        let t1 = store.redeem(&t0).await.unwrap();
        assert_ne!(t0, t1);

        let row = refresh_tokens::find(&db.pool, &t1).await.unwrap().unwrap();
        assert_eq!(row.rotation_count, 1);
        assert!(row.used_at.is_none());
    }

    #[tokio::test]
    async fn reuse_burns_the_chain() {
        let (db, user_id) = seeded().await;
        let store = RefreshTokenStore::new(db.clone(), 60);

        let t0 = store.issue("handle-1", user_id).await.unwrap();
        let t1 = store.redeem(&t0).await.unwrap();

        // Replay the consumed token.
        assert!(matches!(
            store.redeem(&t0).await,
            Err(CrestError::ChainCompromised)
        ));
        // The successor died with the chain and reports the compromise.
        assert!(matches!(
            store.redeem(&t1).await,
            Err(CrestError::ChainCompromised)
        ));
        assert!(refresh_tokens::find(&db.pool, &t1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let (db, _user) = seeded().await;
        let store = RefreshTokenStore::new(db, 60);
        assert!(matches!(
            store.redeem("not-a-token").await,
            Err(CrestError::TokenInvalid)
        ));
    }
}
