//! Channel routes.
//!
//! POST   /channels                          — create (channel.create)
//! GET    /channels                          — list visible channels
//! GET    /channels/{id}                     — channel info
//! DELETE /channels/{id}                     — delete (channel.manage)
//! POST   /channels/{id}/join                — join a public channel
//! POST   /channels/{id}/leave               — leave (owner refused)
//! GET    /channels/{id}/members             — member list (member.view)
//! POST   /channels/{id}/members             — add a member (user.add)
//! DELETE /channels/{id}/members/{user_id}   — kick (user.kick)

use axum::extract::{Extension, Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::channel::{
    AddMemberRequest, Channel, ChannelMember, CreateChannelRequest,
};
use crest_common::models::session::Principal;
use crest_common::permissions::{PermissionScope, perm};
use crest_common::validation::{validate_name, validate_request};
use crest_db::repository::{channels, roles};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::authz;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/channels", post(create_channel).get(list_channels))
        .route("/channels/{channel_id}", get(get_channel).delete(delete_channel))
        .route("/channels/{channel_id}/join", post(join_channel))
        .route("/channels/{channel_id}/leave", post(leave_channel))
        .route(
            "/channels/{channel_id}/members",
            get(list_members).post(add_member),
        )
        .route(
            "/channels/{channel_id}/members/{user_id}",
            delete(kick_member),
        )
}

async fn create_channel(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChannelRequest>,
) -> CrestResult<Json<Channel>> {
    validate_request(&body)?;
    validate_name(&body.name)?;
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::CHANNEL_CREATE,
        PermissionScope::Server,
    )
    .await?;

    // A configured default role must match the channel kind.
    if let Some(role_id) = body.default_role_id {
        let role = roles::find(&state.db.pool, role_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::NotFound { resource: "Role".into() })?;
        if role.scope != body.kind.role_scope() {
            return Err(CrestError::Validation {
                message: "default role scope does not match channel kind".into(),
            });
        }
    }

    let owner = principal.user_id;
    let channel = state
        .db
        .writer
        .enqueue("channel-create", move |pool| async move {
            channels::create(
                &pool,
                &body.name,
                body.kind,
                body.private,
                owner,
                body.default_role_id,
            )
            .await
            .map_err(CrestError::Internal)
        })
        .await?;

    tracing::info!(channel_id = %channel.id, owner = %owner, "channel created");
    Ok(Json(channel))
}

async fn list_channels(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<Vec<Channel>>> {
    let rows = channels::list_visible(&state.db.pool, principal.user_id)
        .await
        .map_err(CrestError::Internal)?;
    Ok(Json(rows))
}

async fn get_channel(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> CrestResult<Json<Channel>> {
    let channel = channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    if channel.private
        && !channels::is_owner_or_member(&state.db.pool, channel_id, principal.user_id)
            .await
            .map_err(CrestError::Internal)?
    {
        return Err(CrestError::NotMember);
    }
    Ok(Json(channel))
}

async fn delete_channel(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> CrestResult<Json<serde_json::Value>> {
    channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::CHANNEL_MANAGE,
        PermissionScope::Channel(channel_id),
    )
    .await?;

    state
        .db
        .writer
        .enqueue("channel-delete", move |pool| async move {
            channels::delete(&pool, channel_id)
                .await
                .map_err(CrestError::Internal)
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn join_channel(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> CrestResult<Json<serde_json::Value>> {
    let channel = channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    if channel.private {
        // Private channels are join-by-invitation only.
        return Err(CrestError::Forbidden);
    }

    let user_id = principal.user_id;
    let default_role = channel.default_role_id;
    state
        .db
        .writer
        .enqueue("channel-join", move |pool| async move {
            channels::add_member(&pool, channel_id, user_id, 0)
                .await
                .map_err(CrestError::Internal)?;
            if let Some(role_id) = default_role {
                roles::assign_channel(&pool, user_id, role_id, channel_id)
                    .await
                    .map_err(CrestError::Internal)?;
            }
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn leave_channel(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> CrestResult<Json<serde_json::Value>> {
    let channel = channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    if channel.owner_user_id == principal.user_id {
        return Err(CrestError::OwnerCannotLeave);
    }

    let user_id = principal.user_id;
    state
        .db
        .writer
        .enqueue("channel-leave", move |pool| async move {
            channels::remove_member(&pool, channel_id, user_id)
                .await
                .map_err(CrestError::Internal)
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn list_members(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
) -> CrestResult<Json<Vec<ChannelMember>>> {
    channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::MEMBER_VIEW,
        PermissionScope::Channel(channel_id),
    )
    .await?;
    let members = channels::list_members(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?;
    Ok(Json(members))
}

async fn add_member(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Json(body): Json<AddMemberRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    let channel = channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::USER_ADD,
        PermissionScope::Channel(channel_id),
    )
    .await?;

    let default_role = channel.default_role_id;
    state
        .db
        .writer
        .enqueue("channel-add-member", move |pool| async move {
            channels::add_member(&pool, channel_id, body.user_id, body.permission_level)
                .await
                .map_err(CrestError::Internal)?;
            if let Some(role_id) = default_role {
                roles::assign_channel(&pool, body.user_id, role_id, channel_id)
                    .await
                    .map_err(CrestError::Internal)?;
            }
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn kick_member(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path((channel_id, user_id)): Path<(Uuid, Uuid)>,
) -> CrestResult<Json<serde_json::Value>> {
    let channel = channels::find(&state.db.pool, channel_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::ChannelNotFound)?;
    if user_id == channel.owner_user_id {
        return Err(CrestError::Forbidden);
    }
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::USER_KICK,
        PermissionScope::Channel(channel_id),
    )
    .await?;

    state
        .db
        .writer
        .enqueue("channel-kick", move |pool| async move {
            channels::remove_member(&pool, channel_id, user_id)
                .await
                .map_err(CrestError::Internal)
        })
        .await?;
    tracing::info!(channel_id = %channel_id, kicked = %user_id, by = %principal.user_id, "member kicked");
    Ok(Json(json!({ "status": "ok" })))
}
