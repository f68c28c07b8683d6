//! End-to-end enrollment flow against an in-memory store: address →
//! one-time code → verified user → backup codes, plus the cool-down and
//! invite-only gates.

use crest_auth::backup::BackupCodeService;
use crest_auth::broker::CredentialBroker;
use crest_auth::geo::NoopGeoLookup;
use crest_auth::machine::AuthStateMachine;
use crest_auth::magic::MagicLinkService;
use crest_auth::mail::NoopMailSender;
use crest_auth::nonce::NonceCache;
use crest_auth::otp::OtpService;
use crest_auth::refresh::RefreshTokenStore;
use crest_auth::registry::DeviceRegistry;
use crest_auth::session::SessionManager;
use crest_auth::tokens::TokenMinter;
use crest_common::config::{LimitsConfig, PolicyConfig};
use crest_common::error::CrestError;
use crest_common::models::session::FlowState;
use crest_db::Database;
use crest_db::repository::{otp as otp_repo, users};
use std::sync::Arc;

fn policy(invite_only: bool) -> PolicyConfig {
    PolicyConfig {
        invite_only,
        allowed_address_suffixes: vec![],
        auto_roles: vec![],
    }
}

fn limits() -> LimitsConfig {
    LimitsConfig {
        max_profile_image_bytes: 1_048_576,
        max_prekeys_per_upload: 1000,
        max_payload_bytes: 262_144,
    }
}

async fn machine(db: Database, invite_only: bool) -> (AuthStateMachine, Arc<SessionManager>) {
    let mailer = Arc::new(NoopMailSender);
    let sessions = Arc::new(SessionManager::new(
        db.clone(),
        Arc::new(NonceCache::new()),
        24,
        90,
    ));
    let machine = AuthStateMachine::new(
        db.clone(),
        Arc::new(OtpService::new(db.clone(), mailer.clone(), 10, 5)),
        Arc::new(BackupCodeService::new(db.clone())),
        Arc::new(
            CredentialBroker::new("https://crest.test", "crest.test", "Crest", &[]).unwrap(),
        ),
        sessions.clone(),
        Arc::new(RefreshTokenStore::new(db.clone(), 60)),
        Arc::new(DeviceRegistry::new(db.clone(), Arc::new(NoopGeoLookup))),
        Arc::new(MagicLinkService::new("https://crest.test", "test-key", 300)),
        Arc::new(TokenMinter::new("crest.test", "test-key")),
        mailer,
        policy(invite_only),
        limits(),
    );
    (machine, sessions)
}

#[tokio::test]
async fn enrollment_walks_the_flow_states() {
    let db = Database::connect_in_memory().await.unwrap();
    let (machine, sessions) = machine(db.clone(), false).await;

    let session = sessions.create_cookie_session().await.unwrap();
    assert_eq!(session.flow_state, FlowState::Anonymous);

    // Enroll: user row appears unverified, exactly one live code.
    let started = machine
        .begin_enrollment(&session, "A@Example.com", None)
        .await
        .unwrap();
    assert!(started.code_sent);
    assert!(!started.existing_user);

    let user = users::find_by_address(&db.pool, "a@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(!user.verified);
    let code_row = otp_repo::find(&db.pool, "a@example.com").await.unwrap().unwrap();

    // Asking again inside the cool-down says how long to wait.
    let session = sessions.load_cookie_session(&session.id).await.unwrap();
    assert_eq!(session.flow_state, FlowState::AwaitingOtp);
    assert!(matches!(
        machine.begin_enrollment(&session, "a@example.com", None).await,
        Err(CrestError::CooldownActive(_))
    ));

    // Wrong code does not advance.
    assert!(matches!(
        machine.verify_otp(&session, "a@example.com", "00000").await,
        Err(CrestError::OtpInvalid)
    ));

    // The right code verifies the user and deletes the row.
    let user = machine
        .verify_otp(&session, "a@example.com", &code_row.code)
        .await
        .unwrap();
    assert!(user.verified);
    assert!(otp_repo::find(&db.pool, "a@example.com").await.unwrap().is_none());

    // Backup codes come out exactly once, then the user consents.
    let session = sessions.load_cookie_session(&session.id).await.unwrap();
    assert_eq!(session.flow_state, FlowState::OtpVerified);
    let codes = machine.emit_backup_codes(&session).await.unwrap();
    assert_eq!(codes.len(), 10);
    assert!(codes.iter().all(|c| c.len() == 16));

    let session = sessions.load_cookie_session(&session.id).await.unwrap();
    assert_eq!(session.flow_state, FlowState::AwaitingBackupCodes);
    assert!(matches!(
        machine.emit_backup_codes(&session).await,
        Err(CrestError::StateMismatch)
    ));

    machine.confirm_backup_codes(&session).await.unwrap();
    let session = sessions.load_cookie_session(&session.id).await.unwrap();
    assert_eq!(session.flow_state, FlowState::AwaitingCredentialEnrollment);
}

#[tokio::test]
async fn invite_only_servers_demand_a_token() {
    let db = Database::connect_in_memory().await.unwrap();
    let (machine, sessions) = machine(db, true).await;
    let session = sessions.create_cookie_session().await.unwrap();

    assert!(matches!(
        machine.begin_enrollment(&session, "x@example.com", None).await,
        Err(CrestError::PolicyRefused(_))
    ));
    assert!(matches!(
        machine
            .begin_enrollment(&session, "x@example.com", Some("not-a-token"))
            .await,
        Err(CrestError::TokenInvalid)
    ));
}

#[tokio::test]
async fn suffix_policy_blocks_foreign_addresses() {
    let db = Database::connect_in_memory().await.unwrap();
    let mailer = Arc::new(NoopMailSender);
    let sessions = Arc::new(SessionManager::new(
        db.clone(),
        Arc::new(NonceCache::new()),
        24,
        90,
    ));
    let machine = AuthStateMachine::new(
        db.clone(),
        Arc::new(OtpService::new(db.clone(), mailer.clone(), 10, 5)),
        Arc::new(BackupCodeService::new(db.clone())),
        Arc::new(
            CredentialBroker::new("https://crest.test", "crest.test", "Crest", &[]).unwrap(),
        ),
        sessions.clone(),
        Arc::new(RefreshTokenStore::new(db.clone(), 60)),
        Arc::new(DeviceRegistry::new(db.clone(), Arc::new(NoopGeoLookup))),
        Arc::new(MagicLinkService::new("https://crest.test", "test-key", 300)),
        Arc::new(TokenMinter::new("crest.test", "test-key")),
        mailer,
        PolicyConfig {
            invite_only: false,
            allowed_address_suffixes: vec!["@corp.example".into()],
            auto_roles: vec![],
        },
        limits(),
    );

    let session = sessions.create_cookie_session().await.unwrap();
    assert!(matches!(
        machine.begin_enrollment(&session, "dev@gmail.com", None).await,
        Err(CrestError::PolicyRefused(_))
    ));
    assert!(
        machine
            .begin_enrollment(&session, "dev@corp.example", None)
            .await
            .unwrap()
            .code_sent
    );
}
