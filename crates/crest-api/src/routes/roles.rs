//! Role routes.
//!
//! GET    /roles                — list roles
//! POST   /roles                — create (role.create)
//! PATCH  /roles/{role_id}      — edit (role.edit; builtin refused)
//! DELETE /roles/{role_id}      — delete (role.delete; builtin refused)
//! POST   /roles/assign         — assign at server or channel scope
//! POST   /roles/unassign       — remove an assignment

use axum::extract::{Extension, Path, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::role::{
    AssignRoleRequest, CreateRoleRequest, Role, UpdateRoleRequest,
};
use crest_common::models::session::Principal;
use crest_common::permissions::{PermissionScope, RoleScope, perm};
use crest_common::validation::validate_request;
use crest_db::repository::{channels, roles};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::authz;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/{role_id}", patch(update_role).delete(delete_role))
        .route("/roles/assign", post(assign_role))
        .route("/roles/unassign", post(unassign_role))
}

async fn list_roles(
    Extension(_principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> CrestResult<Json<Vec<Role>>> {
    let rows = roles::list(&state.db.pool).await.map_err(CrestError::Internal)?;
    Ok(Json(rows))
}

async fn create_role(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRoleRequest>,
) -> CrestResult<Json<Role>> {
    validate_request(&body)?;
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::ROLE_CREATE,
        PermissionScope::Server,
    )
    .await?;

    let role = state
        .db
        .writer
        .enqueue("role-create", move |pool| async move {
            if roles::find_by_name(&pool, &body.name, body.scope)
                .await
                .map_err(CrestError::Internal)?
                .is_some()
            {
                return Err(CrestError::AlreadyExists { resource: "Role".into() });
            }
            roles::create(
                &pool,
                &body.name,
                body.description.as_deref(),
                body.scope,
                &body.permissions,
                false,
            )
            .await
            .map_err(CrestError::Internal)
        })
        .await?;
    Ok(Json(role))
}

async fn update_role(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<Uuid>,
    Json(body): Json<UpdateRoleRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    validate_request(&body)?;
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::ROLE_EDIT,
        PermissionScope::Server,
    )
    .await?;

    state
        .db
        .writer
        .enqueue("role-update", move |pool| async move {
            let role = roles::find(&pool, role_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::NotFound { resource: "Role".into() })?;
            if role.builtin {
                return Err(CrestError::Forbidden);
            }
            roles::update(
                &pool,
                role_id,
                body.name.as_deref(),
                body.description.as_deref(),
                body.permissions.as_deref(),
            )
            .await
            .map_err(CrestError::Internal)
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn delete_role(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<Uuid>,
) -> CrestResult<Json<serde_json::Value>> {
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::ROLE_DELETE,
        PermissionScope::Server,
    )
    .await?;

    state
        .db
        .writer
        .enqueue("role-delete", move |pool| async move {
            let role = roles::find(&pool, role_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::NotFound { resource: "Role".into() })?;
            if role.builtin {
                return Err(CrestError::Forbidden);
            }
            roles::delete(&pool, role_id)
                .await
                .map_err(CrestError::Internal)
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Assign a role. Channel-scope assignments demand that the role's scope
/// match the channel's kind.
async fn assign_role(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssignRoleRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::ROLE_ASSIGN,
        match body.channel_id {
            Some(channel_id) => PermissionScope::Channel(channel_id),
            None => PermissionScope::Server,
        },
    )
    .await?;

    state
        .db
        .writer
        .enqueue("role-assign", move |pool| async move {
            let role = roles::find(&pool, body.role_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::NotFound { resource: "Role".into() })?;
            match body.channel_id {
                None => {
                    if role.scope != RoleScope::Server {
                        return Err(CrestError::Validation {
                            message: "role is not server-scoped".into(),
                        });
                    }
                    roles::assign_server(&pool, body.user_id, body.role_id)
                        .await
                        .map_err(CrestError::Internal)
                }
                Some(channel_id) => {
                    let channel = channels::find(&pool, channel_id)
                        .await
                        .map_err(CrestError::Internal)?
                        .ok_or(CrestError::ChannelNotFound)?;
                    if role.scope != channel.kind.role_scope() {
                        return Err(CrestError::Validation {
                            message: "role scope does not match channel kind".into(),
                        });
                    }
                    roles::assign_channel(&pool, body.user_id, body.role_id, channel_id)
                        .await
                        .map_err(CrestError::Internal)
                }
            }
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn unassign_role(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssignRoleRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::ROLE_ASSIGN,
        match body.channel_id {
            Some(channel_id) => PermissionScope::Channel(channel_id),
            None => PermissionScope::Server,
        },
    )
    .await?;

    state
        .db
        .writer
        .enqueue("role-unassign", move |pool| async move {
            match body.channel_id {
                None => roles::unassign_server(&pool, body.user_id, body.role_id)
                    .await
                    .map_err(CrestError::Internal),
                Some(channel_id) => {
                    roles::unassign_channel(&pool, body.user_id, body.role_id, channel_id)
                        .await
                        .map_err(CrestError::Internal)
                }
            }
        })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}
