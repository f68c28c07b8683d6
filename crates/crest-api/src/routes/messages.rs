//! Encrypted-envelope routes.
//!
//! POST   /messages/direct                  — store a per-device batch
//! POST   /channels/{channel_id}/messages   — group send (fan-out)
//! GET    /messages/direct/{peer_user_id}   — direct inbox vs one peer
//! GET    /channels/{channel_id}/messages   — channel inbox
//! GET    /messages/channels                — all-channels inbox
//! DELETE /messages                         — delete by message id
//! GET    /messages/legacy-inbox            — device-only read, feature-gated

use axum::extract::{Extension, Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::envelope::{
    DeleteEnvelopesRequest, DirectSendRequest, Envelope, GroupSendRequest,
};
use crest_common::models::session::Principal;
use crest_db::fanout::{self, DirectSend, GroupSend};
use crest_db::repository::{channels, envelopes};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;

const DEFAULT_KIND: &str = "message";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/messages/direct", post(send_direct))
        .route("/messages/direct/{peer_user_id}", get(read_direct))
        .route("/messages/channels", get(read_all_channels))
        .route("/messages", delete(delete_messages))
        .route("/messages/legacy-inbox", get(read_legacy_inbox))
        .route(
            "/channels/{channel_id}/messages",
            get(read_channel).post(send_group),
        )
}

// ============================================================
// Sends
// ============================================================

async fn send_direct(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<DirectSendRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    if body.envelopes.is_empty() {
        return Err(CrestError::Validation {
            message: "at least one per-device envelope is required".into(),
        });
    }
    let config = crest_common::config::get();
    for env in &body.envelopes {
        if env.payload.len() as u64 > config.limits.max_payload_bytes {
            return Err(CrestError::Validation {
                message: "payload exceeds the configured maximum".into(),
            });
        }
    }

    let stored = fanout::send_direct(
        &state.db,
        principal.user_id,
        principal.device_id,
        DirectSend {
            message_id: body.message_id,
            receiver_user_id: body.receiver_user_id,
            kind: body.kind.unwrap_or_else(|| DEFAULT_KIND.into()),
            cipher_kind: body.cipher_kind,
            per_device: body
                .envelopes
                .into_iter()
                .map(|e| (e.receiver_device_id, e.payload))
                .collect(),
        },
    )
    .await?;
    Ok(Json(json!({ "status": "ok", "stored": stored })))
}

async fn send_group(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Json(body): Json<GroupSendRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    let config = crest_common::config::get();
    if body.ciphertext.len() as u64 > config.limits.max_payload_bytes {
        return Err(CrestError::Validation {
            message: "payload exceeds the configured maximum".into(),
        });
    }

    let stored = fanout::send_group(
        &state.db,
        principal.user_id,
        principal.device_id,
        GroupSend {
            channel_id,
            message_id: body.message_id,
            ciphertext: body.ciphertext,
            kind: body.kind.unwrap_or_else(|| DEFAULT_KIND.into()),
            cipher_kind: body.cipher_kind,
            timestamp: body.timestamp,
        },
    )
    .await?;
    Ok(Json(json!({ "status": "ok", "stored": stored })))
}

// ============================================================
// Inbox reads — always bound to the caller's (user, device)
// ============================================================

async fn read_direct(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(peer_user_id): Path<Uuid>,
) -> CrestResult<Json<Vec<Envelope>>> {
    let rows = envelopes::inbox_direct(
        &state.db.pool,
        principal.user_id,
        principal.device_id,
        peer_user_id,
    )
    .await
    .map_err(CrestError::Internal)?;
    Ok(Json(rows))
}

async fn read_channel(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> CrestResult<Json<Vec<Envelope>>> {
    channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    if !channels::is_owner_or_member(&state.db.pool, channel_id, principal.user_id)
        .await
        .map_err(CrestError::Internal)?
    {
        return Err(CrestError::NotMember);
    }
    let rows = envelopes::inbox_channel(
        &state.db.pool,
        principal.user_id,
        principal.device_id,
        channel_id,
    )
    .await
    .map_err(CrestError::Internal)?;
    Ok(Json(rows))
}

async fn read_all_channels(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<Vec<Envelope>>> {
    let rows = envelopes::inbox_all_channels(
        &state.db.pool,
        principal.user_id,
        principal.device_id,
    )
    .await
    .map_err(CrestError::Internal)?;
    Ok(Json(rows))
}

/// The legacy device-only binding is cross-user leaky; it stays refused
/// unless the operator has opted in explicitly.
async fn read_legacy_inbox(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<Vec<Envelope>>> {
    let config = crest_common::config::get();
    if !config.messaging.allow_legacy_device_inbox {
        return Err(CrestError::PolicyRefused(
            "legacy device-only inbox reads are disabled".into(),
        ));
    }
    let rows = envelopes::inbox_by_device_only(&state.db.pool, principal.device_id)
        .await
        .map_err(CrestError::Internal)?;
    Ok(Json(rows))
}

// ============================================================
// Deletes
// ============================================================

async fn delete_messages(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteEnvelopesRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    let deleted = fanout::delete_envelopes(
        &state.db,
        principal.user_id,
        body.message_id,
        body.receiver_user_id,
        body.receiver_device_id,
    )
    .await?;
    Ok(Json(json!({ "status": "ok", "deleted": deleted })))
}
