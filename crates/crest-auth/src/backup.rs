//! Backup codes — the recovery fallback when every authenticator is gone.
//!
//! Ten codes of sixteen characters from a 36-symbol alphabet, stored as
//! bcrypt hashes with a used flag, shown in plaintext exactly once.
//! Consecutive failures inside one in-progress session back off
//! exponentially: `ceil(60 · 1.8^(n−1))` seconds after the n-th failure,
//! enforced before the store is touched. Regeneration opens up only when at
//! most one unused code remains.

use chrono::{DateTime, Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::user::BackupCode;
use crest_db::Database;
use crest_db::repository::{sessions, users};
use rand::Rng;
use uuid::Uuid;

const CODE_COUNT: usize = 10;
const CODE_LEN: usize = 16;
const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Seconds a session must wait after `failures` consecutive misses.
pub fn backoff_wait_secs(failures: i64) -> u64 {
    if failures <= 0 {
        return 0;
    }
    (60.0 * 1.8f64.powi((failures - 1) as i32)).ceil() as u64
}

pub struct BackupCodeService {
    db: Database,
    bcrypt_cost: u32,
}

impl BackupCodeService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    #[cfg(test)]
    pub fn with_cost(db: Database, bcrypt_cost: u32) -> Self {
        Self { db, bcrypt_cost }
    }

    fn random_code() -> String {
        let mut rng = rand::rng();
        (0..CODE_LEN)
            .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
            .collect()
    }

    /// Emit a fresh batch for a user. Allowed once; after that only
    /// [`Self::regenerate`] can clear the way for another batch. Returns the
    /// plaintext list — the only time it ever exists outside the client.
    pub async fn emit(&self, user_id: Uuid) -> CrestResult<Vec<String>> {
        let plaintext: Vec<String> = (0..CODE_COUNT).map(|_| Self::random_code()).collect();
        let cost = self.bcrypt_cost;
        let mut hashed = Vec::with_capacity(CODE_COUNT);
        for code in &plaintext {
            let hash = bcrypt::hash(code, cost).map_err(|e| CrestError::Internal(e.into()))?;
            hashed.push(BackupCode { hash, used: false });
        }

        self.db
            .writer
            .enqueue("backup-codes-emit", move |pool| async move {
                let user = users::find_by_id(&pool, user_id)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::UserNotFound)?;
                if user.backup_codes_issued {
                    return Err(CrestError::AlreadyExists {
                        resource: "Backup codes".into(),
                    });
                }
                users::set_backup_codes(&pool, user_id, &hashed, true)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(())
            })
            .await?;

        Ok(plaintext)
    }

    /// Verify a code for a user within an in-progress session, applying the
    /// session's backoff state. A hit flips the code's used flag atomically.
    pub async fn verify(
        &self,
        session_id: &str,
        failures: i64,
        last_failure_at: Option<DateTime<Utc>>,
        user_id: Uuid,
        code: &str,
    ) -> CrestResult<()> {
        // Backoff gate: never touches the store while the wait is running.
        if let Some(last) = last_failure_at {
            let wait = backoff_wait_secs(failures);
            let gate_ends = last + Duration::seconds(wait as i64);
            let now = Utc::now();
            if now < gate_ends {
                let remaining = (gate_ends - now).num_milliseconds();
                return Err(CrestError::TooEarly((remaining as u64).div_ceil(1000)));
            }
        }

        let user = users::find_by_id(&self.db.pool, user_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserNotFound)?;
        if user.backup_codes.0.is_empty() {
            return Err(CrestError::NoBackupCodes);
        }

        let presented = code.trim().to_uppercase();
        let matched = user
            .backup_codes
            .0
            .iter()
            .position(|c| !c.used && bcrypt::verify(&presented, &c.hash).unwrap_or(false));

        let session = session_id.to_string();
        match matched {
            Some(index) => {
                self.db
                    .writer
                    .enqueue("backup-code-consume", move |pool| async move {
                        // Re-read inside the closure: the list may have moved
                        // under us between check and consume.
                        let user = users::find_by_id(&pool, user_id)
                            .await
                            .map_err(CrestError::Internal)?
                            .ok_or(CrestError::UserNotFound)?;
                        let mut codes = user.backup_codes.0;
                        let slot = codes.get_mut(index).ok_or(CrestError::OtpInvalid)?;
                        if slot.used {
                            return Err(CrestError::OtpInvalid);
                        }
                        slot.used = true;
                        users::set_backup_codes(&pool, user_id, &codes, true)
                            .await
                            .map_err(CrestError::Internal)?;
                        sessions::set_cookie_backup_failures(&pool, &session, 0, None)
                            .await
                            .map_err(CrestError::Internal)?;
                        Ok(())
                    })
                    .await
            }
            None => {
                let next_failures = failures + 1;
                self.db
                    .writer
                    .enqueue("backup-code-failure", move |pool| async move {
                        sessions::set_cookie_backup_failures(
                            &pool,
                            &session,
                            next_failures,
                            Some(Utc::now()),
                        )
                        .await
                        .map_err(CrestError::Internal)?;
                        Ok(())
                    })
                    .await?;
                Err(CrestError::OtpInvalid)
            }
        }
    }

    /// Clear the stored list so a fresh batch can be requested. Only allowed
    /// once at most one unused code remains.
    pub async fn regenerate(&self, user_id: Uuid) -> CrestResult<()> {
        self.db
            .writer
            .enqueue("backup-codes-regenerate", move |pool| async move {
                let user = users::find_by_id(&pool, user_id)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::UserNotFound)?;
                if !user.backup_codes_issued {
                    return Err(CrestError::NoBackupCodes);
                }
                if user.unused_backup_codes() > 1 {
                    return Err(CrestError::RegenerateNotYetAllowed);
                }
                users::set_backup_codes(&pool, user_id, &[], false)
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

    #[test]
    fn backoff_is_monotone_and_matches_formula() {
        assert_eq!(backoff_wait_secs(0), 0);
        assert_eq!(backoff_wait_secs(1), 60);
        assert_eq!(backoff_wait_secs(2), 108);
        // ceil(60 * 1.8^2) = ceil(194.4) = 195
        assert_eq!(backoff_wait_secs(3), 195);
        let mut prev = 0;
        for n in 1..=10 {
            let w = backoff_wait_secs(n);
            assert!(w > prev, "backoff must grow with n");
            prev = w;
        }
    }

    #[test]
    fn codes_use_the_36_symbol_alphabet() {
        let code = BackupCodeService::random_code();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
    }
}
