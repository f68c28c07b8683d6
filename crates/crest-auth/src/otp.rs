//! One-time numeric codes.
//!
//! Five digits for enrollment, six for recovery. Per address there is at
//! most one live code; a fresh generation is admitted only once
//! `(expiry − wait)` minutes have passed since the last issuance, otherwise
//! the caller gets `CooldownActive` with the seconds remaining. Verification
//! is constant-time, single-use, and deletes the row on success.

use chrono::{Duration, Utc};
use crest_common::error::{CrestError, CrestResult};
use crest_common::keys::ct_eq;
use crest_common::models::user::MailKind;
use crest_db::Database;
use crest_db::repository::otp;
use rand::Rng;
use std::sync::Arc;

use crate::mail::MailSender;

/// What the code is for; decides its length and the mail copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Enrollment,
    Recovery,
}

impl CodePurpose {
    fn digits(&self) -> usize {
        match self {
            CodePurpose::Enrollment => 5,
            CodePurpose::Recovery => 6,
        }
    }
}

pub struct OtpService {
    db: Database,
    mailer: Arc<dyn MailSender>,
    expiry: Duration,
    resend_wait: Duration,
}

impl OtpService {
    pub fn new(db: Database, mailer: Arc<dyn MailSender>, expiry_mins: i64, wait_mins: i64) -> Self {
        Self {
            db,
            mailer,
            expiry: Duration::minutes(expiry_mins),
            resend_wait: Duration::minutes(wait_mins),
        }
    }

    fn random_code(digits: usize) -> String {
        let mut rng = rand::rng();
        (0..digits).map(|_| char::from(b'0' + rng.random_range(0..10u8))).collect()
    }

    /// Generate a code for the address and dispatch it by mail. Subject to
    /// the per-address cool-down.
    pub async fn generate(&self, address: &str, purpose: CodePurpose) -> CrestResult<()> {
        let expiry = self.expiry;
        let cooldown = self.expiry - self.resend_wait;
        let code = Self::random_code(purpose.digits());
        let addr = address.to_string();
        let stored_code = code.clone();

        self.db
            .writer
            .enqueue("otp-generate", move |pool| async move {
                let now = Utc::now();
                if let Some(existing) = otp::find(&pool, &addr).await.map_err(CrestError::Internal)? {
                    let cooldown_ends = existing.created_at + cooldown;
                    if existing.expires_at > now && now < cooldown_ends {
                        let remaining = (cooldown_ends - now).num_milliseconds();
                        return Err(CrestError::CooldownActive((remaining as u64).div_ceil(1000)));
                    }
                }
                otp::replace(&pool, &addr, &stored_code, now + expiry)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(())
            })
            .await?;

        let subject = match purpose {
            CodePurpose::Enrollment => "Your verification code",
            CodePurpose::Recovery => "Your account recovery code",
        };
        let body = format!("Your code is: {code}\n\nIt expires in {} minutes.", self.expiry.num_minutes());
        if let Err(e) = self.mailer.send(address, subject, &body, MailKind::Authentication).await {
            // Generation still succeeded; the operator reads the code
            // out-of-band in dev setups.
            tracing::warn!(address, error = %e, "failed to dispatch one-time code");
        }
        Ok(())
    }

    /// Validate and consume a code. Deletes the row on success; expired rows
    /// are deleted on sight.
    pub async fn verify(&self, address: &str, code: &str) -> CrestResult<()> {
        let addr = address.to_string();
        let presented = code.to_string();
        self.db
            .writer
            .enqueue("otp-verify", move |pool| async move {
                let row = otp::find(&pool, &addr)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::OtpInvalid)?;
                if Utc::now() >= row.expires_at {
                    otp::delete(&pool, &addr).await.map_err(CrestError::Internal)?;
                    return Err(CrestError::OtpExpired);
                }
                if !ct_eq(&row.code, &presented) {
                    return Err(CrestError::OtpInvalid);
                }
                otp::delete(&pool, &addr).await.map_err(CrestError::Internal)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::NoopMailSender;

    fn service(db: Database) -> OtpService {
        OtpService::new(db, Arc::new(NoopMailSender), 10, 5)
    }

    #[tokio::test]
    async fn generate_then_verify_consumes_code() {
        let db = Database::connect_in_memory().await.unwrap();
        let svc = service(db.clone());

        svc.generate("a@example.com", CodePurpose::Enrollment).await.unwrap();
        let row = otp::find(&db.pool, "a@example.com").await.unwrap().unwrap();
        assert_eq!(row.code.len(), 5);

        svc.verify("a@example.com", &row.code).await.unwrap();
        assert!(otp::find(&db.pool, "a@example.com").await.unwrap().is_none());

        // Single-use: the same code no longer verifies.
        assert!(matches!(
            svc.verify("a@example.com", &row.code).await,
            Err(CrestError::OtpInvalid)
        ));
    }

    #[tokio::test]
    async fn regenerating_inside_cooldown_says_wait() {
        let db = Database::connect_in_memory().await.unwrap();
        let svc = service(db.clone());

        svc.generate("b@example.com", CodePurpose::Enrollment).await.unwrap();
        let err = svc
            .generate("b@example.com", CodePurpose::Enrollment)
            .await
            .unwrap_err();
        match err {
            CrestError::CooldownActive(secs) => assert!(secs > 0 && secs <= 5 * 60),
            other => panic!("expected CooldownActive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_code_does_not_consume() {
        let db = Database::connect_in_memory().await.unwrap();
        let svc = service(db.clone());

        svc.generate("c@example.com", CodePurpose::Recovery).await.unwrap();
        assert!(matches!(
            svc.verify("c@example.com", "000000x").await,
            Err(CrestError::OtpInvalid)
        ));
        assert!(otp::find(&db.pool, "c@example.com").await.unwrap().is_some());
    }
}
