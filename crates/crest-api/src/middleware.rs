//! Middleware — the dual-mode auth verifier and the flow-session layer.
//!
//! Native requests carry the four `X-…` signing headers; browser requests
//! carry the session cookie. When both are present the HMAC path wins.
//! Either way handlers receive one [`Principal`] and must not branch on the
//! method except for side channels.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::SET_COOKIE;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use crest_common::error::CrestError;
use crest_common::models::session::{AuthMethod, CookieSession, Principal};
use crest_db::repository::users;
use std::sync::Arc;

use crate::AppState;

/// Cookie carrying the opaque session id.
pub const SESSION_COOKIE: &str = "crest_session";

pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";

/// Largest request body the HMAC verifier will buffer.
const MAX_SIGNED_BODY_BYTES: usize = 2 * 1024 * 1024;

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

fn session_cookie_value(config: &crest_common::config::AppConfig, id: &str) -> String {
    let mut cookie = format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Strict");
    if config.server.public_url.starts_with("https://") {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Dual-mode verifier for protected routes.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, CrestError> {
    let has_hmac_headers = request.headers().contains_key(HEADER_CLIENT_ID);

    if has_hmac_headers {
        let client_handle = header(&request, HEADER_CLIENT_ID)
            .ok_or(CrestError::NoCredentials)?
            .to_string();
        let timestamp_ms: i64 = header(&request, HEADER_TIMESTAMP)
            .ok_or(CrestError::NoCredentials)?
            .parse()
            .map_err(|_| CrestError::MalformedInput("X-Timestamp".into()))?;
        let nonce = header(&request, HEADER_NONCE)
            .ok_or(CrestError::NoCredentials)?
            .to_string();
        let signature = header(&request, HEADER_SIGNATURE)
            .ok_or(CrestError::NoCredentials)?
            .to_string();

        // The signature covers path and body, so the body gets buffered
        // here and handed back to the handler untouched.
        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();
        let bytes = axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES)
            .await
            .map_err(|_| CrestError::MalformedInput("request body too large".into()))?;
        let body_str = std::str::from_utf8(&bytes)
            .map_err(|_| CrestError::MalformedInput("request body is not UTF-8".into()))?;

        let session = state
            .sessions
            .verify_hmac_request(
                &client_handle,
                timestamp_ms,
                &nonce,
                &signature,
                &path,
                body_str,
            )
            .await?;

        let principal = Principal {
            user_id: session.user_id,
            device_id: session.device_id,
            client_handle: session.client_handle,
            method: AuthMethod::Hmac,
        };
        let mut request = Request::from_parts(parts, Body::from(bytes));
        request.extensions_mut().insert(principal);
        return Ok(next.run(request).await);
    }

    // Cookie path.
    let jar = CookieJar::from_headers(request.headers());
    let cookie = jar.get(SESSION_COOKIE).ok_or(CrestError::NoCredentials)?;
    let session = state.sessions.load_cookie_session(cookie.value()).await?;

    let (user_id, device_id, client_handle) =
        match (session.user_id, session.device_id, session.client_handle) {
            (Some(u), Some(d), Some(h)) => (u, d, h),
            _ => return Err(CrestError::NotAuthenticated),
        };

    let user = users::find_by_id(&state.db.pool, user_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::UserMissing)?;
    if !user.active {
        return Err(CrestError::UserInactive);
    }

    let principal = Principal {
        user_id,
        device_id,
        client_handle,
        method: AuthMethod::Cookie,
    };
    let mut request = request;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Flow-session layer for the enrollment / login routes: loads the cookie
/// session, creating an anonymous one when absent, and sets the cookie on
/// the way out when it was created here.
pub async fn flow_session_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, CrestError> {
    let jar = CookieJar::from_headers(request.headers());
    let existing = match jar.get(SESSION_COOKIE) {
        Some(cookie) => state.sessions.load_cookie_session(cookie.value()).await.ok(),
        None => None,
    };

    let (session, created): (CookieSession, bool) = match existing {
        Some(session) => (session, false),
        None => (state.sessions.create_cookie_session().await?, true),
    };
    let session_id = session.id.clone();

    let mut request = request;
    request.extensions_mut().insert(session);
    let mut response = next.run(request).await;

    if created {
        let config = crest_common::config::get();
        if let Ok(value) = session_cookie_value(config, &session_id).parse() {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    Ok(response)
}
