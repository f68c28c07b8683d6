//! Invitation routes.
//!
//! POST /invites — mint a time-limited invitation link (user.add)

use axum::extract::{Extension, State};
use axum::routing::post;
use axum::{Json, Router};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::enroll::CreateInviteRequest;
use crest_common::models::session::Principal;
use crest_common::models::user::MailKind;
use crest_common::permissions::{PermissionScope, perm};
use crest_common::validation::normalize_address;
use crest_db::repository::{invites, users};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::authz;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/invites", post(create_invite))
}

async fn create_invite(
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateInviteRequest>,
) -> CrestResult<Json<serde_json::Value>> {
    authz::require_permission(
        &state.db,
        principal.user_id,
        perm::USER_ADD,
        PermissionScope::Server,
    )
    .await?;

    let config = crest_common::config::get();
    let ttl_hours = body
        .ttl_hours
        .unwrap_or(config.auth.invite_token_ttl_hours)
        .clamp(1, 30 * 24);
    let address = match &body.address {
        Some(addr) => Some(normalize_address(addr)?),
        None => None,
    };

    let invite_id = Uuid::new_v4();
    let stored_address = address.clone();
    let created_by = principal.user_id;
    let expires_at = Utc::now() + chrono::Duration::hours(ttl_hours);
    state
        .db
        .writer
        .enqueue("invite-create", move |pool| async move {
            invites::create(
                &pool,
                invite_id,
                stored_address.as_deref(),
                Some(created_by),
                expires_at,
            )
            .await
            .map_err(CrestError::Internal)?;
            Ok(())
        })
        .await?;

    let token = state
        .minter
        .mint_invite(invite_id, address.as_deref(), ttl_hours)?;
    let link = format!(
        "{}/invite?token={}",
        config.server.public_url.trim_end_matches('/'),
        token
    );

    // Mail the invitation when it is bound to an address. The preference
    // switches are authoritative: a self-invite is gated on the creator's
    // flag, anything else on the recipient's (when already enrolled).
    if let Some(ref addr) = address {
        let creator = users::find_by_id(&state.db.pool, principal.user_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserMissing)?;
        let (kind, wanted) = if *addr == creator.address {
            (MailKind::SelfInvite, creator.wants(MailKind::SelfInvite))
        } else {
            let wanted = match users::find_by_address(&state.db.pool, addr)
                .await
                .map_err(CrestError::Internal)?
            {
                Some(recipient) => recipient.wants(MailKind::Invite),
                None => true, // not enrolled yet; nothing to honor
            };
            (MailKind::Invite, wanted)
        };
        if wanted {
            if let Err(e) = state
                .mailer
                .send(
                    addr,
                    "You have been invited",
                    &format!("Join with this link (expires in {ttl_hours} hours):\n\n{link}"),
                    kind,
                )
                .await
            {
                tracing::warn!(address = %addr, error = %e, "failed to dispatch invite mail");
            }
        } else {
            tracing::debug!(address = %addr, "invite mail suppressed by preference");
        }
    }

    Ok(Json(json!({
        "invite_id": invite_id,
        "token": token,
        "link": link,
        "expires_at": expires_at,
    })))
}
