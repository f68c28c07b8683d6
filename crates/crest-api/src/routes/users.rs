//! User routes.
//!
//! GET    /users/me              — the caller's profile
//! PATCH  /users/me/preferences  — notification preference switches
//! DELETE /users/me              — hard account deletion
//! GET    /users/{user_id}       — another user's public profile

use axum::extract::{Extension, Path, State};
use axum::routing::{get, patch};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::session::Principal;
use crest_common::models::user::{UpdatePreferencesRequest, UserResponse};
use crest_common::permissions::{PermissionScope, perm};
use crest_db::repository::users;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::authz;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users/me", get(me).delete(delete_account))
        .route("/users/me/preferences", patch(update_preferences))
        .route("/users/{user_id}", get(get_user))
}

async fn me(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<UserResponse>> {
    let user = users::find_by_id(&state.db.pool, principal.user_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::UserMissing)?;
    Ok(Json(user.into()))
}

async fn update_preferences(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdatePreferencesRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    let user_id = principal.user_id;
    state
        .db
        .writer
        .enqueue("preferences-update", move |pool| async move {
            users::update_preferences(
                &pool,
                user_id,
                body.invite_email_enabled,
                body.update_email_enabled,
                body.cancel_email_enabled,
                body.self_invite_email_enabled,
                body.rsvp_to_organizer_email_enabled,
            )
            .await
            .map_err(CrestError::Internal)
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Hard delete: the user row goes, and devices, pre-keys, sessions, refresh
/// tokens, envelopes, memberships, and role assignments cascade with it.
async fn delete_account(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<serde_json::Value>> {
    let user_id = principal.user_id;
    state
        .db
        .writer
        .enqueue("account-delete", move |pool| async move {
            users::delete_account(&pool, user_id)
                .await
                .map_err(CrestError::Internal)
        })
        .await?;
    tracing::info!(user_id = %user_id, "account deleted");
    Ok(Json(json!({ "status": "ok" })))
}

async fn get_user(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> CrestResult<Json<UserResponse>> {
    if user_id != principal.user_id {
        authz::require_permission(
            &state.db,
            principal.user_id,
            perm::MEMBER_VIEW,
            PermissionScope::Server,
        )
        .await?;
    }
    let user = users::find_by_id(&state.db.pool, user_id)
        .await
        .map_err(CrestError::Internal)?
        .ok_or(CrestError::UserNotFound)?;
    Ok(Json(user.into()))
}
