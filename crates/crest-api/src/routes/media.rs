//! Media routes — room tokens for the external media service and the ICE
//! configuration for peer setup.
//!
//! POST /media/rooms/{channel_id}/token — mint a room token
//! GET  /media/ice-servers              — STUN/TURN configuration

use axum::extract::{Extension, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::channel::ChannelKind;
use crest_common::models::session::Principal;
use crest_db::repository::{channels, users};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/media/rooms/{channel_id}/token", post(mint_room_token))
        .route("/media/ice-servers", get(ice_servers))
}

#[derive(Debug, Deserialize)]
struct RoomTokenBody {
    #[serde(default = "default_true")]
    can_publish: bool,
    #[serde(default = "default_true")]
    can_subscribe: bool,
}

fn default_true() -> bool {
    true
}

/// Room tokens only exist for realtime channels, and only for their owner
/// or members.
async fn mint_room_token(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Json(body): Json<RoomTokenBody>,
) -> CrestResult<Json<serde_json::Value>> {
    let channel = channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    if channel.kind != ChannelKind::Realtime {
        return Err(CrestError::Validation {
            message: "room tokens are only minted for realtime channels".into(),
        });
    }
    if !channels::is_owner_or_member(&state.db.pool, channel_id, principal.user_id)
        .await
        .map_err(CrestError::Internal)?
    {
        return Err(CrestError::NotMember);
    }

    let user = users::find_by_id(&state.db.pool, principal.user_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::UserMissing)?;
    let display = user
        .display_handle
        .clone()
        .unwrap_or_else(|| user.address.clone());

    let minted = state.media.mint_room_token(
        principal.user_id,
        &display,
        &channel.id.to_string(),
        body.can_publish,
        body.can_subscribe,
        channel.owner_user_id == principal.user_id,
    )?;

    Ok(Json(json!({
        "token": minted.token,
        "expires_at": minted.expires_at,
        "room": channel.id,
    })))
}

async fn ice_servers(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<serde_json::Value>> {
    let servers = state.media.ice_servers(principal.user_id);
    Ok(Json(json!({ "ice_servers": servers })))
}
