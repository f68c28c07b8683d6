//! Authentication routes.
//!
//! Flow routes (cookie flow session, may be anonymous):
//! POST /auth/enroll                      — begin enrollment for an address
//! POST /auth/otp                         — confirm the one-time code
//! POST /auth/backup-codes                — emit backup codes (once)
//! POST /auth/backup-codes/confirm        — consent that codes are stored
//! POST /auth/backup-codes/verify         — recovery via a backup code
//! POST /auth/recovery                    — start account recovery
//! POST /auth/credentials/enroll/options  — attestation options
//! POST /auth/credentials/enroll          — finish attestation
//! POST /auth/credentials/assert/options  — assertion options
//! POST /auth/credentials/assert          — finish assertion (login)
//! POST /auth/csrf-state                  — one-shot embedded-browser state
//! POST /auth/profile                     — profile step, completes the flow
//! POST /auth/magic-link                  — mail a magic link
//! POST /auth/magic-link/redeem           — redeem a magic link
//! POST /auth/handoff                     — redeem an auth hand-off token
//! POST /auth/token/refresh               — rotate a refresh token
//!
//! Session routes (authenticated principal):
//! POST /auth/session/refresh             — extend the current session
//! POST /auth/logout                      — revoke the current session

use axum::extract::{Extension, Request, State};
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use crest_auth::machine::RequestMeta;
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::enroll::{BeginEnrollmentRequest, VerifyOtpRequest};
use crest_common::models::session::{AuthMethod, CookieSession, Principal};
use crest_common::models::user::UpdateProfileRequest;
use crest_common::validation::validate_request;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

use crate::middleware::SESSION_COOKIE;
use crate::AppState;

/// Routes riding on the flow session.
pub fn flow_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/enroll", post(begin_enrollment))
        .route("/auth/otp", post(verify_otp))
        .route("/auth/backup-codes", post(emit_backup_codes))
        .route("/auth/backup-codes/confirm", post(confirm_backup_codes))
        .route("/auth/backup-codes/verify", post(verify_backup_code))
        .route("/auth/recovery", post(begin_recovery))
        .route("/auth/credentials/enroll/options", post(enroll_options))
        .route("/auth/credentials/enroll", post(enroll_credential))
        .route("/auth/credentials/assert/options", post(assert_options))
        .route("/auth/credentials/assert", post(assert_credential))
        .route("/auth/csrf-state", post(mint_csrf_state))
        .route("/auth/profile", post(complete_profile))
        .route("/auth/magic-link", post(request_magic_link))
        .route("/auth/magic-link/redeem", post(redeem_magic_link))
        .route("/auth/handoff", post(redeem_handoff))
        .route("/auth/token/refresh", post(rotate_refresh_token))
}

/// Routes requiring an authenticated principal.
pub fn session_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/session/refresh", post(refresh_session))
        .route("/auth/logout", post(logout))
}

fn request_meta(request: &Request) -> RequestMeta {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    RequestMeta {
        ip: header("x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
            .or_else(|| header("x-real-ip")),
        user_agent: header("user-agent"),
    }
}

// ============================================================
// Enrollment
// ============================================================

async fn begin_enrollment(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<BeginEnrollmentRequest>,
) -> CrestResult<impl IntoResponse> {
    validate_request(&body)?;
    let started = state
        .machine
        .begin_enrollment(&session, &body.address, body.invitation_token.as_deref())
        .await?;
    Ok(Json(started))
}

async fn verify_otp(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<VerifyOtpRequest>,
) -> CrestResult<impl IntoResponse> {
    validate_request(&body)?;
    let user = state
        .machine
        .verify_otp(&session, &body.address, &body.code)
        .await?;
    tracing::info!(user_id = %user.id, "address verified");
    Ok(Json(json!({ "status": "ok", "user_id": user.id })))
}

// ============================================================
// Backup codes
// ============================================================

async fn emit_backup_codes(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
) -> CrestResult<impl IntoResponse> {
    let codes = state.machine.emit_backup_codes(&session).await?;
    Ok(Json(json!({ "backup_codes": codes })))
}

async fn confirm_backup_codes(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
) -> CrestResult<impl IntoResponse> {
    state.machine.confirm_backup_codes(&session).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct BackupCodeBody {
    code: String,
}

async fn verify_backup_code(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<BackupCodeBody>,
) -> CrestResult<impl IntoResponse> {
    state.machine.verify_backup_code(&session, &body.code).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct RecoveryBody {
    address: String,
}

async fn begin_recovery(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<RecoveryBody>,
) -> CrestResult<impl IntoResponse> {
    state.machine.begin_recovery(&session, &body.address).await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ============================================================
// Credential enrollment
// ============================================================

async fn enroll_options(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
) -> CrestResult<impl IntoResponse> {
    let (options, challenge_id) = state.machine.begin_credential_enrollment(&session).await?;
    Ok(Json(json!({ "options": options, "challenge_id": challenge_id })))
}

#[derive(Deserialize)]
struct EnrollCredentialBody {
    challenge_id: String,
    attestation: RegisterPublicKeyCredential,
    client_handle: Option<String>,
}

async fn enroll_credential(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    request: Request,
) -> CrestResult<Response> {
    let meta = request_meta(&request);
    let body: EnrollCredentialBody = json_body(request).await?;
    let grant = state
        .machine
        .enroll_credential(
            &session,
            &body.challenge_id,
            &body.attestation,
            body.client_handle.as_deref(),
            &meta,
        )
        .await?;
    Ok(Json(json!({ "status": "ok", "session": grant })).into_response())
}

// ============================================================
// Credential assertion
// ============================================================

#[derive(Deserialize)]
struct AssertOptionsBody {
    address: String,
}

async fn assert_options(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssertOptionsBody>,
) -> CrestResult<impl IntoResponse> {
    let (options, challenge_id) = state.machine.begin_assertion(&body.address).await?;
    Ok(Json(json!({ "options": options, "challenge_id": challenge_id })))
}

#[derive(Deserialize)]
struct AssertCredentialBody {
    challenge_id: String,
    address: String,
    assertion: PublicKeyCredential,
    client_handle: String,
    #[serde(default)]
    from_embedded_browser: bool,
    csrf_state: Option<String>,
}

async fn assert_credential(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    request: Request,
) -> CrestResult<Response> {
    let meta = request_meta(&request);
    let body: AssertCredentialBody = json_body(request).await?;
    let grant = state
        .machine
        .assert_credential(
            Some(&session),
            &body.challenge_id,
            &body.assertion,
            &body.address,
            &body.client_handle,
            body.from_embedded_browser,
            body.csrf_state.as_deref(),
            &meta,
        )
        .await?;
    Ok(Json(json!({ "status": "ok", "session": grant })).into_response())
}

async fn mint_csrf_state(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
) -> CrestResult<impl IntoResponse> {
    let csrf_state = state.machine.mint_csrf_state(&session).await?;
    Ok(Json(json!({ "csrf_state": csrf_state })))
}

// ============================================================
// Profile
// ============================================================

async fn complete_profile(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<UpdateProfileRequest>,
) -> CrestResult<impl IntoResponse> {
    validate_request(&body)?;
    let image = match &body.profile_image {
        Some(encoded) => Some(
            B64.decode(encoded)
                .map_err(|_| CrestError::MalformedInput("profile_image".into()))?,
        ),
        None => None,
    };
    state
        .machine
        .complete_profile(
            &session,
            body.display_handle.as_deref(),
            body.short_handle.as_deref(),
            image,
        )
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ============================================================
// Magic links
// ============================================================

#[derive(Deserialize)]
struct MagicLinkBody {
    address: String,
}

async fn request_magic_link(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MagicLinkBody>,
) -> CrestResult<impl IntoResponse> {
    state.machine.request_magic_link(&body.address).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct RedeemMagicLinkBody {
    token: String,
    client_handle: String,
}

async fn redeem_magic_link(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> CrestResult<Response> {
    let meta = request_meta(&request);
    let body: RedeemMagicLinkBody = json_body(request).await?;
    let grant = state
        .machine
        .login_via_magic_link(&body.token, &body.client_handle, &meta)
        .await?;
    Ok(Json(json!({ "status": "ok", "session": grant })).into_response())
}

// ============================================================
// Hand-off
// ============================================================

#[derive(Deserialize)]
struct HandoffBody {
    token: String,
    client_handle: String,
}

async fn redeem_handoff(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> CrestResult<Response> {
    let meta = request_meta(&request);
    let body: HandoffBody = json_body(request).await?;
    let (user_id, credential_id) = state.minter.redeem_handoff(&state.db, &body.token).await?;
    tracing::debug!(user_id = %user_id, credential_id = %credential_id, "hand-off redeemed");
    let grant = state
        .machine
        .grant_session_for(user_id, &body.client_handle, &meta)
        .await?;
    Ok(Json(json!({ "status": "ok", "session": grant })).into_response())
}

// ============================================================
// Refresh tokens
// ============================================================

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn rotate_refresh_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> CrestResult<impl IntoResponse> {
    let next = state.refresh.redeem(&body.refresh_token).await?;
    Ok(Json(json!({ "refresh_token": next })))
}

// ============================================================
// Session maintenance
// ============================================================

async fn refresh_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    jar: CookieJar,
) -> CrestResult<impl IntoResponse> {
    // Side channel: which session store to extend depends on how the
    // request authenticated.
    match principal.method {
        AuthMethod::Hmac => {
            let expires_at = state
                .sessions
                .refresh_hmac_session(&principal.client_handle)
                .await?;
            Ok(Json(json!({ "status": "ok", "expires_at": expires_at })))
        }
        AuthMethod::Cookie => {
            let cookie = jar.get(SESSION_COOKIE).ok_or(CrestError::NoSession)?;
            state.sessions.extend_cookie_session(cookie.value()).await?;
            Ok(Json(json!({ "status": "ok" })))
        }
    }
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    jar: CookieJar,
) -> CrestResult<Response> {
    match principal.method {
        AuthMethod::Hmac => {
            state
                .sessions
                .revoke_hmac_session(&principal.client_handle)
                .await?;
            state.refresh.revoke_chain(&principal.client_handle).await?;
            Ok(Json(json!({ "status": "ok" })).into_response())
        }
        AuthMethod::Cookie => {
            if let Some(cookie) = jar.get(SESSION_COOKIE) {
                state.sessions.destroy_cookie_session(cookie.value()).await?;
            }
            let mut response = Json(json!({ "status": "ok" })).into_response();
            let cleared = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0");
            if let Ok(value) = cleared.parse() {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Ok(response)
        }
    }
}

// ============================================================
// Helpers
// ============================================================

/// Read and deserialize a JSON body from a raw request. Used by handlers
/// that also need the request headers for [`RequestMeta`].
async fn json_body<T: serde::de::DeserializeOwned>(request: Request) -> CrestResult<T> {
    let bytes = axum::body::to_bytes(request.into_body(), 2 * 1024 * 1024)
        .await
        .map_err(|_| CrestError::MalformedInput("request body".into()))?;
    serde_json::from_slice(&bytes).map_err(|e| CrestError::MalformedInput(e.to_string()))
}
