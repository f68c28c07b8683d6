//! Device routes.
//!
//! GET    /devices              — list the caller's devices
//! DELETE /devices/{device_id}  — remove one of the caller's devices

use axum::extract::{Extension, Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::device::DeviceResponse;
use crest_common::models::session::Principal;
use crest_db::repository::devices;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{device_id}", delete(remove_device))
}

async fn list_devices(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<Vec<DeviceResponse>>> {
    let devices = devices::list_for_user(&state.db.pool, principal.user_id)
        .await
        .map_err(CrestError::Internal)?;
    Ok(Json(devices.into_iter().map(Into::into).collect()))
}

/// Refuses to remove the device the current session belongs to; the user
/// must act from another session.
async fn remove_device(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<i64>,
) -> CrestResult<Json<serde_json::Value>> {
    // Pre-keys, HMAC sessions, and refresh tokens scoped to the device go
    // with it inside the registry's serialized delete.
    state
        .registry
        .remove(principal.user_id, device_id, &principal.client_handle)
        .await?;

    tracing::info!(user_id = %principal.user_id, device_id, "device removed");
    Ok(Json(json!({ "status": "ok" })))
}
