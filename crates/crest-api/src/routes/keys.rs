//! Key-material routes — identity keys, signed pre-keys, the one-time pool,
//! and bundle fetches for session initiators.
//!
//! PUT  /keys/identity            — publish identity key + registration id
//! POST /keys/signed-prekey       — append a signed pre-key rotation
//! POST /keys/prekeys             — bulk one-time pre-key upload (may 202)
//! GET  /keys/status              — minimal status for the caller's device
//! POST /keys/sync                — compare client state with server truth
//! GET  /users/{user_id}/bundle   — fetch bundles (consumes one-time keys)

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::keys::{validate_identity_key, validate_prekey_blob};
use crest_common::models::device::{
    ClientKeyState, PublishIdentityRequest, PublishPreKeysRequest, PublishSignedPreKeyRequest,
};
use crest_common::models::session::Principal;
use crest_common::validation::validate_request;
use crest_db::prekeystore;
use crest_db::serializer::Submit;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/keys/identity", put(publish_identity))
        .route("/keys/signed-prekey", post(publish_signed_prekey))
        .route("/keys/prekeys", post(publish_prekeys))
        .route("/keys/status", get(key_status))
        .route("/keys/sync", post(key_sync))
        .route("/users/{user_id}/bundle", get(fetch_bundle))
}

async fn publish_identity(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishIdentityRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    validate_request(&body)?;
    validate_identity_key(&body.identity_key).map_err(|e| CrestError::Validation {
        message: format!("identity_key: {e}"),
    })?;
    prekeystore::publish_identity(
        &state.db,
        principal.user_id,
        principal.device_id,
        body.identity_key,
        body.registration_id,
    )
    .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn publish_signed_prekey(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishSignedPreKeyRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    validate_request(&body)?;
    validate_prekey_blob(&body.blob, "signed_prekey").map_err(|e| CrestError::Validation {
        message: e.to_string(),
    })?;
    prekeystore::publish_signed_prekey(
        &state.db,
        principal.user_id,
        principal.device_id,
        body.prekey_id,
        body.blob,
    )
    .await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Bulk upload with the 5-second soft deadline: past it the client gets
/// `202 Accepted` while the write finishes in the background, still ordered
/// before any later writes for this device.
async fn publish_prekeys(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishPreKeysRequest>,
) -> CrestResult<Response> {
    let config = crest_common::config::get();
    if body.prekeys.len() > config.limits.max_prekeys_per_upload as usize {
        return Err(CrestError::Validation {
            message: format!(
                "cannot upload more than {} pre-keys at once",
                config.limits.max_prekeys_per_upload
            ),
        });
    }
    let mut keys = Vec::with_capacity(body.prekeys.len());
    for upload in &body.prekeys {
        validate_prekey_blob(&upload.blob, "prekey").map_err(|e| CrestError::Validation {
            message: e.to_string(),
        })?;
        keys.push((upload.prekey_id, upload.blob.clone()));
    }

    let soft_deadline = Duration::from_secs(config.serializer.prekey_soft_deadline_secs);
    let outcome = prekeystore::publish_prekeys_bulk(
        &state.db,
        principal.user_id,
        principal.device_id,
        keys,
        soft_deadline,
    )
    .await?;

    match outcome {
        Submit::Completed(result) => {
            let stored = result?;
            Ok(Json(json!({ "status": "ok", "stored": stored })).into_response())
        }
        Submit::Accepted => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted" })),
        )
            .into_response()),
    }
}

async fn key_status(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<impl IntoResponse> {
    let status =
        prekeystore::minimal_status(&state.db, principal.user_id, principal.device_id).await?;
    Ok(Json(status))
}

async fn key_sync(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(claimed): Json<ClientKeyState>,
) -> CrestResult<impl IntoResponse> {
    let diff = prekeystore::validate_and_sync(
        &state.db,
        principal.user_id,
        principal.device_id,
        &claimed,
    )
    .await?;
    Ok(Json(diff))
}

/// Bundles for every device of the target user plus the caller's other
/// devices. Selected one-time pre-keys are destroyed before the response.
async fn fetch_bundle(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> CrestResult<impl IntoResponse> {
    let bundles = prekeystore::fetch_bundles(
        &state.db,
        user_id,
        principal.user_id,
        principal.device_id,
    )
    .await?;
    Ok(Json(bundles))
}
