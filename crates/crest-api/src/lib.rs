//! # crest-api
//!
//! REST surface for Crest. Routes are grouped per concern; everything
//! outside the enrollment flow sits behind the dual-mode auth middleware,
//! which yields a unified [`crest_common::models::session::Principal`]
//! regardless of whether the caller is a browser (cookie) or a native
//! client (per-request HMAC).

pub mod authz;
pub mod media;
pub mod middleware;
pub mod routes;

use axum::Router;
use crest_auth::machine::AuthStateMachine;
use crest_auth::mail::MailSender;
use crest_auth::refresh::RefreshTokenStore;
use crest_auth::registry::DeviceRegistry;
use crest_auth::session::SessionManager;
use crest_auth::tokens::TokenMinter;
use crest_db::Database;
use media::MediaTokenMinter;
use std::sync::Arc;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub sessions: Arc<SessionManager>,
    pub machine: Arc<AuthStateMachine>,
    pub refresh: Arc<RefreshTokenStore>,
    pub registry: Arc<DeviceRegistry>,
    pub minter: Arc<TokenMinter>,
    pub media: Arc<MediaTokenMinter>,
    pub mailer: Arc<dyn MailSender>,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);

    // Enrollment / login flows ride on the cookie flow session.
    let flow_routes = routes::auth::flow_router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::flow_session_middleware,
    ));

    // Everything else demands an authenticated principal.
    let protected_routes = Router::new()
        .merge(routes::auth::session_router())
        .merge(routes::users::router())
        .merge(routes::devices::router())
        .merge(routes::keys::router())
        .merge(routes::messages::router())
        .merge(routes::channels::router())
        .merge(routes::roles::router())
        .merge(routes::invites::router())
        .merge(routes::media::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let api_routes = Router::new()
        .merge(flow_routes)
        .merge(protected_routes)
        .merge(routes::health::router());

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            2 * 1024 * 1024,
        ))
        .with_state(state)
}
