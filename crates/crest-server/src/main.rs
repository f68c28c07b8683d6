//! # Crest Server
//!
//! Single-process binary wiring the store, the write serializer, the
//! authentication services, and the REST API together.

use crest_api::{AppState, build_router, media::MediaTokenMinter};
use crest_auth::backup::BackupCodeService;
use crest_auth::broker::CredentialBroker;
use crest_auth::machine::AuthStateMachine;
use crest_auth::magic::MagicLinkService;
use crest_auth::nonce::NonceCache;
use crest_auth::otp::OtpService;
use crest_auth::refresh::RefreshTokenStore;
use crest_auth::registry::DeviceRegistry;
use crest_auth::session::SessionManager;
use crest_auth::tokens::TokenMinter;
use crest_db::Database;
use crest_db::repository::roles;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = crest_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crest=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Crest v{}", env!("CARGO_PKG_VERSION"));

    // Connect to the store; runs migrations and spawns the write serializer.
    let db = Database::connect(config).await?;

    // Builtin roles exist before anything else runs.
    db.writer
        .enqueue("seed-builtin-roles", |pool| async move {
            roles::seed_builtins(&pool)
                .await
                .map_err(crest_common::error::CrestError::Internal)
        })
        .await?;

    // === Service wiring ===
    let mailer = crest_auth::mail::from_config(&config.mail)?;
    let geo = crest_auth::geo::from_config(&config.geo)?;
    let nonces = Arc::new(NonceCache::new());

    let sessions = Arc::new(SessionManager::new(
        db.clone(),
        nonces.clone(),
        config.auth.cookie_session_hours,
        config.auth.hmac_session_days,
    ));
    let otp = Arc::new(OtpService::new(
        db.clone(),
        mailer.clone(),
        config.auth.otp_expiry_mins,
        config.auth.otp_resend_wait_mins,
    ));
    let backup = Arc::new(BackupCodeService::new(db.clone()));
    let broker = Arc::new(CredentialBroker::new(
        &config.server.public_url,
        &config.server.rp_id(),
        &config.auth.rp_name,
        &config.auth.app_origins,
    )?);
    let refresh = Arc::new(RefreshTokenStore::new(
        db.clone(),
        config.auth.refresh_token_days,
    ));
    let registry = Arc::new(DeviceRegistry::new(db.clone(), geo));
    let magic = Arc::new(MagicLinkService::new(
        &config.server.public_url,
        &config.auth.signing_key,
        config.auth.magic_link_ttl_secs,
    ));
    let minter = Arc::new(TokenMinter::new(
        &config.server.rp_id(),
        &config.auth.signing_key,
    ));
    let media = Arc::new(MediaTokenMinter::new(
        &config.server.rp_id(),
        &config.auth.signing_key,
        &config.media,
    ));

    let machine = Arc::new(AuthStateMachine::new(
        db.clone(),
        otp,
        backup,
        broker,
        sessions.clone(),
        refresh.clone(),
        registry.clone(),
        magic,
        minter.clone(),
        mailer.clone(),
        config.policy.clone(),
        config.limits.clone(),
    ));

    // === REST API server ===
    let state = AppState {
        db,
        sessions,
        machine,
        refresh,
        registry,
        minter,
        media,
        mailer,
    };
    let router = build_router(state);
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    tracing::info!("REST API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
