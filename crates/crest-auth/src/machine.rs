//! The authentication state machine.
//!
//! Per in-progress cookie session the flow moves
//! `Anonymous → AwaitingOtp → OtpVerified → AwaitingBackupCodes →
//! AwaitingCredentialEnrollment → AwaitingProfile → Complete`, advancing
//! only on the success contracts of the subcomponents. A login by
//! credential assertion short-circuits straight to `Complete`. Failed
//! assertions never advance the machine; backup-code failures back off
//! exponentially per session.

use chrono::Utc;
use crest_common::config::{AutoRoleRule, LimitsConfig, PolicyConfig};
use crest_common::error::{CrestError, CrestResult};
use crest_common::models::session::{CookieSession, FlowState};
use crest_common::models::user::{MailKind, User};
use crest_common::permissions::RoleScope;
use crest_common::validation::{check_address_policy, normalize_address, validate_handle};
use crest_db::Database;
use crest_db::repository::{invites, roles, sessions, users};
use std::sync::Arc;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse,
};

use crate::backup::BackupCodeService;
use crate::broker::CredentialBroker;
use crate::magic::MagicLinkService;
use crate::mail::MailSender;
use crate::otp::{CodePurpose, OtpService};
use crate::refresh::RefreshTokenStore;
use crate::registry::DeviceRegistry;
use crate::session::{MintedHmacSession, SessionManager};
use crate::tokens::TokenMinter;

/// Request metadata threaded through the flows.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of `begin_enrollment`.
#[derive(Debug, serde::Serialize)]
pub struct EnrollmentStarted {
    /// True when the address already belongs to a verified account with
    /// credentials — the "please log in" branch. Disclosing existence here
    /// is intentional and documented.
    pub existing_user: bool,
    /// True when a one-time code was dispatched.
    pub code_sent: bool,
}

/// Result of an assertion or enrollment that minted native credentials.
#[derive(Debug, serde::Serialize)]
pub struct SessionGrant {
    pub user_id: Uuid,
    pub device_id: i64,
    #[serde(flatten)]
    pub hmac: MintedHmacSession,
    pub refresh_token: String,
}

pub struct AuthStateMachine {
    db: Database,
    otp: Arc<OtpService>,
    backup: Arc<BackupCodeService>,
    broker: Arc<CredentialBroker>,
    sessions: Arc<SessionManager>,
    refresh: Arc<RefreshTokenStore>,
    registry: Arc<DeviceRegistry>,
    magic: Arc<MagicLinkService>,
    minter: Arc<TokenMinter>,
    mailer: Arc<dyn MailSender>,
    policy: PolicyConfig,
    limits: LimitsConfig,
}

impl AuthStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        otp: Arc<OtpService>,
        backup: Arc<BackupCodeService>,
        broker: Arc<CredentialBroker>,
        sessions: Arc<SessionManager>,
        refresh: Arc<RefreshTokenStore>,
        registry: Arc<DeviceRegistry>,
        magic: Arc<MagicLinkService>,
        minter: Arc<TokenMinter>,
        mailer: Arc<dyn MailSender>,
        policy: PolicyConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            db,
            otp,
            backup,
            broker,
            sessions,
            refresh,
            registry,
            magic,
            minter,
            mailer,
            policy,
            limits,
        }
    }

    async fn update_flow(
        &self,
        session_id: &str,
        user_id: Option<Uuid>,
        pending_address: Option<String>,
        flow_state: FlowState,
        client_handle: Option<String>,
        device_id: Option<i64>,
        csrf_state: Option<String>,
        pending_invite_id: Option<Uuid>,
    ) -> CrestResult<()> {
        let id = session_id.to_string();
        self.db
            .writer
            .enqueue("session-flow-update", move |pool| async move {
                sessions::update_cookie_flow(
                    &pool,
                    &id,
                    user_id,
                    pending_address.as_deref(),
                    flow_state,
                    client_handle.as_deref(),
                    device_id,
                    csrf_state.as_deref(),
                    pending_invite_id,
                )
                .await
                .map_err(CrestError::Internal)
            })
            .await
    }

    // ============================================================
    // Enrollment
    // ============================================================

    /// Open an enrollment flow for an address.
    pub async fn begin_enrollment(
        &self,
        session: &CookieSession,
        address: &str,
        invitation_token: Option<&str>,
    ) -> CrestResult<EnrollmentStarted> {
        let address = normalize_address(address)?;
        check_address_policy(&address, &self.policy.allowed_address_suffixes)?;

        // Invite-only servers demand a valid, unused, address-matching token.
        let pending_invite_id = if self.policy.invite_only {
            let token = invitation_token
                .ok_or_else(|| CrestError::PolicyRefused("invitation required".into()))?;
            let (invite_id, bound_address) = self.minter.verify_invite(token)?;
            let invite = invites::find(&self.db.pool, invite_id)
                .await
                .map_err(CrestError::Internal)?
                .ok_or(CrestError::TokenInvalid)?;
            if invite.used {
                return Err(CrestError::TokenRevoked);
            }
            if invite.expires_at <= Utc::now() {
                return Err(CrestError::TokenExpired);
            }
            let bound = bound_address.or(invite.address);
            if let Some(bound) = bound
                && bound != address
            {
                return Err(CrestError::PolicyRefused(
                    "invitation is bound to a different address".into(),
                ));
            }
            Some(invite_id)
        } else {
            None
        };

        // Existing verified account with credentials: tell the client to log
        // in instead of re-enrolling.
        if let Some(existing) = users::find_by_address(&self.db.pool, &address)
            .await
            .map_err(CrestError::Internal)?
            && existing.verified
            && !existing.credentials.0.is_empty()
        {
            return Ok(EnrollmentStarted {
                existing_user: true,
                code_sent: false,
            });
        }

        let addr = address.clone();
        self.db
            .writer
            .enqueue("user-ensure", move |pool| async move {
                users::create_if_absent(&pool, &addr)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await?;

        // Cool-down violations surface from the OTP service as
        // CooldownActive(seconds).
        self.otp.generate(&address, CodePurpose::Enrollment).await?;

        self.update_flow(
            &session.id,
            None,
            Some(address),
            FlowState::AwaitingOtp,
            None,
            None,
            None,
            pending_invite_id,
        )
        .await?;

        Ok(EnrollmentStarted {
            existing_user: false,
            code_sent: true,
        })
    }

    /// Confirm the one-time code: verifies the user, consumes the pending
    /// invitation, applies auto-assigned roles, advances to `OtpVerified`.
    pub async fn verify_otp(
        &self,
        session: &CookieSession,
        address: &str,
        code: &str,
    ) -> CrestResult<User> {
        let address = normalize_address(address)?;
        if session.flow_state != FlowState::AwaitingOtp
            || session.pending_address.as_deref() != Some(address.as_str())
        {
            return Err(CrestError::StateMismatch);
        }

        self.otp.verify(&address, code).await?;

        let addr = address.clone();
        let pending_invite = session.pending_invite_id;
        let auto_roles: Vec<AutoRoleRule> = self
            .policy
            .auto_roles
            .iter()
            .filter(|rule| rule.address.to_lowercase() == address)
            .cloned()
            .collect();

        let user = self
            .db
            .writer
            .enqueue("otp-confirm", move |pool| async move {
                let user = users::mark_verified(&pool, &addr)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::UserNotFound)?;

                if let Some(invite_id) = pending_invite {
                    invites::mark_used(&pool, invite_id)
                        .await
                        .map_err(CrestError::Internal)?;
                }

                for rule in &auto_roles {
                    for role_name in &rule.roles {
                        match roles::find_by_name(&pool, role_name, RoleScope::Server)
                            .await
                            .map_err(CrestError::Internal)?
                        {
                            Some(role) => roles::assign_server(&pool, user.id, role.id)
                                .await
                                .map_err(CrestError::Internal)?,
                            None => {
                                tracing::warn!(role = %role_name, "auto-assign role does not exist")
                            }
                        }
                    }
                }
                Ok(user)
            })
            .await?;

        self.update_flow(
            &session.id,
            Some(user.id),
            Some(address),
            FlowState::OtpVerified,
            None,
            None,
            None,
            None,
        )
        .await?;

        Ok(user)
    }

    // ============================================================
    // Backup codes
    // ============================================================

    /// Emit the user's backup codes. Once per user; advances the session to
    /// `AwaitingBackupCodes` until the user confirms they stored them.
    pub async fn emit_backup_codes(&self, session: &CookieSession) -> CrestResult<Vec<String>> {
        let user_id = self.require_user(session)?;
        if session.flow_state != FlowState::OtpVerified {
            return Err(CrestError::StateMismatch);
        }
        let codes = self.backup.emit(user_id).await?;
        self.update_flow(
            &session.id,
            Some(user_id),
            session.pending_address.clone(),
            FlowState::AwaitingBackupCodes,
            None,
            None,
            None,
            None,
        )
        .await?;
        Ok(codes)
    }

    /// The user consents that the codes are stored; move on to credential
    /// enrollment.
    pub async fn confirm_backup_codes(&self, session: &CookieSession) -> CrestResult<()> {
        let user_id = self.require_user(session)?;
        if session.flow_state != FlowState::AwaitingBackupCodes {
            return Err(CrestError::StateMismatch);
        }
        self.update_flow(
            &session.id,
            Some(user_id),
            session.pending_address.clone(),
            FlowState::AwaitingCredentialEnrollment,
            None,
            None,
            None,
            None,
        )
        .await
    }

    /// Recovery fallback: present a backup code after a recovery OTP.
    /// Success re-opens credential enrollment for the session.
    pub async fn verify_backup_code(
        &self,
        session: &CookieSession,
        code: &str,
    ) -> CrestResult<()> {
        let user_id = self.require_user(session)?;
        if session.flow_state != FlowState::OtpVerified {
            return Err(CrestError::StateMismatch);
        }
        self.backup
            .verify(
                &session.id,
                session.backup_failures,
                session.last_backup_failure_at,
                user_id,
                code,
            )
            .await?;
        self.update_flow(
            &session.id,
            Some(user_id),
            session.pending_address.clone(),
            FlowState::AwaitingCredentialEnrollment,
            None,
            None,
            None,
            None,
        )
        .await
    }

    // ============================================================
    // Credential enrollment
    // ============================================================

    /// Open an attestation ceremony for the session's user.
    pub async fn begin_credential_enrollment(
        &self,
        session: &CookieSession,
    ) -> CrestResult<(CreationChallengeResponse, String)> {
        let user_id = self.require_user(session)?;
        if !matches!(
            session.flow_state,
            FlowState::OtpVerified
                | FlowState::AwaitingCredentialEnrollment
                | FlowState::Complete
        ) {
            return Err(CrestError::StateMismatch);
        }
        let user = users::find_by_id(&self.db.pool, user_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserNotFound)?;
        self.broker
            .start_registration(user.id, &user.address, &user.credentials.0)
    }

    /// Verify an attestation and append the credential. For the first
    /// credential of a native client a session grant is minted as well.
    pub async fn enroll_credential(
        &self,
        session: &CookieSession,
        challenge_id: &str,
        attestation: &RegisterPublicKeyCredential,
        client_handle: Option<&str>,
        meta: &RequestMeta,
    ) -> CrestResult<Option<SessionGrant>> {
        let user_id = self.require_user(session)?;

        let location = None; // resolved during device sighting below
        let (owner, credential) = self.broker.finish_registration(
            challenge_id,
            attestation,
            meta.ip.as_deref(),
            location,
        )?;
        if owner != user_id {
            return Err(CrestError::Forbidden);
        }

        let appended = credential.clone();
        let first_credential = self
            .db
            .writer
            .enqueue("credential-append", move |pool| async move {
                let user = users::find_by_id(&pool, user_id)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::UserNotFound)?;
                let mut credentials = user.credentials.0;
                let first = credentials.is_empty();
                if credentials.iter().any(|c| c.id == appended.id) {
                    return Err(CrestError::AlreadyExists {
                        resource: "Credential".into(),
                    });
                }
                credentials.push(appended);
                users::set_credentials(&pool, user_id, &credentials)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(first)
            })
            .await?;

        let grant = match client_handle {
            Some(handle) if first_credential => {
                Some(self.grant_session(user_id, handle, meta).await?)
            }
            _ => None,
        };

        self.update_flow(
            &session.id,
            Some(user_id),
            session.pending_address.clone(),
            FlowState::AwaitingProfile,
            grant.as_ref().map(|g| g.hmac.client_handle.clone()),
            grant.as_ref().map(|g| g.device_id),
            None,
            None,
        )
        .await?;

        Ok(grant)
    }

    // ============================================================
    // Credential assertion (login)
    // ============================================================

    /// Open an assertion ceremony for an address.
    pub async fn begin_assertion(
        &self,
        address: &str,
    ) -> CrestResult<(RequestChallengeResponse, String)> {
        let address = normalize_address(address)?;
        let user = users::find_by_address(&self.db.pool, &address)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserNotFound)?;
        if !user.verified {
            return Err(CrestError::AccountUnverified);
        }
        self.broker.start_authentication(&user.credentials.0)
    }

    /// Verify an assertion and mint the caller's session. Short-circuits the
    /// flow to `Complete`.
    #[allow(clippy::too_many_arguments)]
    pub async fn assert_credential(
        &self,
        session: Option<&CookieSession>,
        challenge_id: &str,
        assertion: &PublicKeyCredential,
        address: &str,
        client_handle: &str,
        from_embedded_browser: bool,
        csrf_state: Option<&str>,
        meta: &RequestMeta,
    ) -> CrestResult<SessionGrant> {
        let address = normalize_address(address)?;
        let user = users::find_by_address(&self.db.pool, &address)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserNotFound)?;

        // Embedded-browser flows must present the one-time csrf_state minted
        // into the enrolling session.
        if from_embedded_browser {
            let session = session.ok_or(CrestError::NoSession)?;
            let expected = session.csrf_state.as_deref().ok_or(CrestError::StateMismatch)?;
            let presented = csrf_state.ok_or(CrestError::StateMismatch)?;
            if !crest_common::keys::ct_eq(expected, presented) {
                return Err(CrestError::StateMismatch);
            }
            // Consume: the value is one-shot.
            self.update_flow(
                &session.id,
                session.user_id,
                session.pending_address.clone(),
                session.flow_state,
                session.client_handle.clone(),
                session.device_id,
                None,
                session.pending_invite_id,
            )
            .await?;
        }

        let credential_id =
            self.broker
                .finish_authentication(challenge_id, assertion, &user.credentials.0)?;

        let user_id = user.id;
        let cred_id = credential_id.clone();
        let ip = meta.ip.clone();
        self.db
            .writer
            .enqueue("credential-metadata", move |pool| async move {
                let user = users::find_by_id(&pool, user_id)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::UserNotFound)?;
                let mut credentials = user.credentials.0;
                if let Some(cred) = credentials.iter_mut().find(|c| c.id == cred_id) {
                    cred.last_login = Some(Utc::now());
                    cred.ip = ip.clone();
                }
                users::set_credentials(&pool, user_id, &credentials)
                    .await
                    .map_err(CrestError::Internal)?;
                users::set_active(&pool, user_id, true)
                    .await
                    .map_err(CrestError::Internal)?;
                Ok(())
            })
            .await?;

        let grant = self.grant_session(user.id, client_handle, meta).await?;

        if let Some(session) = session {
            self.update_flow(
                &session.id,
                Some(user.id),
                None,
                FlowState::Complete,
                Some(grant.hmac.client_handle.clone()),
                Some(grant.device_id),
                None,
                None,
            )
            .await?;
        }

        Ok(grant)
    }

    /// Mint the one-time csrf_state an embedded-browser flow will echo back.
    pub async fn mint_csrf_state(&self, session: &CookieSession) -> CrestResult<String> {
        use rand::RngCore;
        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        let state = hex::encode(raw);
        self.update_flow(
            &session.id,
            session.user_id,
            session.pending_address.clone(),
            session.flow_state,
            session.client_handle.clone(),
            session.device_id,
            Some(state.clone()),
            session.pending_invite_id,
        )
        .await?;
        Ok(state)
    }

    // ============================================================
    // Magic links
    // ============================================================

    /// Mail a magic link to a verified account.
    pub async fn request_magic_link(&self, address: &str) -> CrestResult<()> {
        let address = normalize_address(address)?;
        let user = users::find_by_address(&self.db.pool, &address)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserNotFound)?;
        if !user.verified {
            return Err(CrestError::AccountUnverified);
        }
        let link = self.magic.generate(&address, user.id);
        if let Err(e) = self
            .mailer
            .send(
                &address,
                "Your sign-in link",
                &format!("Open this link to sign in (valid for 5 minutes):\n\n{link}"),
                MailKind::Authentication,
            )
            .await
        {
            tracing::warn!(address = %address, error = %e, "failed to dispatch magic link");
        }
        Ok(())
    }

    /// Redeem a magic link for a native session grant.
    pub async fn login_via_magic_link(
        &self,
        token: &str,
        client_handle: &str,
        meta: &RequestMeta,
    ) -> CrestResult<SessionGrant> {
        let identity = self.magic.verify(token)?;
        let user = users::find_by_id(&self.db.pool, identity.user_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserMissing)?;
        if !user.active {
            return Err(CrestError::UserInactive);
        }
        self.grant_session(user.id, client_handle, meta).await
    }

    // ============================================================
    // Recovery
    // ============================================================

    /// Start account recovery: a six-digit code to the address.
    pub async fn begin_recovery(
        &self,
        session: &CookieSession,
        address: &str,
    ) -> CrestResult<()> {
        let address = normalize_address(address)?;
        let user = users::find_by_address(&self.db.pool, &address)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserNotFound)?;
        if !user.verified {
            return Err(CrestError::AccountUnverified);
        }
        self.otp.generate(&address, CodePurpose::Recovery).await?;
        self.update_flow(
            &session.id,
            None,
            Some(address),
            FlowState::AwaitingOtp,
            None,
            None,
            None,
            None,
        )
        .await
    }

    // ============================================================
    // Profile
    // ============================================================

    /// Persist the profile step and complete the flow.
    pub async fn complete_profile(
        &self,
        session: &CookieSession,
        display_handle: Option<&str>,
        short_handle: Option<&str>,
        profile_image: Option<Vec<u8>>,
    ) -> CrestResult<()> {
        let user_id = self.require_user(session)?;
        if let Some(h) = display_handle {
            validate_handle(h)?;
        }
        if let Some(h) = short_handle {
            validate_handle(h)?;
        }
        if let Some(ref image) = profile_image
            && image.len() as u64 > self.limits.max_profile_image_bytes
        {
            return Err(CrestError::Validation {
                message: "profile image exceeds 1 MiB".into(),
            });
        }

        let display = display_handle.map(String::from);
        let short = short_handle.map(String::from);
        self.db
            .writer
            .enqueue("profile-update", move |pool| async move {
                users::update_profile(
                    &pool,
                    user_id,
                    display.as_deref(),
                    short.as_deref(),
                    profile_image.as_deref(),
                )
                .await
                .map_err(|e| match e.downcast_ref::<sqlx::Error>() {
                    Some(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                        CrestError::AlreadyExists {
                            resource: "Handle".into(),
                        }
                    }
                    _ => CrestError::Internal(e),
                })
            })
            .await?;

        self.update_flow(
            &session.id,
            Some(user_id),
            None,
            FlowState::Complete,
            session.client_handle.clone(),
            session.device_id,
            None,
            None,
        )
        .await
    }

    // ============================================================
    // Helpers
    // ============================================================

    fn require_user(&self, session: &CookieSession) -> CrestResult<Uuid> {
        session.user_id.ok_or(CrestError::NotAuthenticated)
    }

    /// Mint the native-client session bundle for an already-authenticated
    /// identity (e.g. a redeemed hand-off token).
    pub async fn grant_session_for(
        &self,
        user_id: Uuid,
        client_handle: &str,
        meta: &RequestMeta,
    ) -> CrestResult<SessionGrant> {
        let user = users::find_by_id(&self.db.pool, user_id)
            .await
            .map_err(CrestError::Internal)?
            .ok_or(CrestError::UserMissing)?;
        if !user.active {
            return Err(CrestError::UserInactive);
        }
        self.grant_session(user_id, client_handle, meta).await
    }

    /// Device sighting + HMAC session + refresh chain, the bundle every
    /// successful login path produces for native clients.
    async fn grant_session(
        &self,
        user_id: Uuid,
        client_handle: &str,
        meta: &RequestMeta,
    ) -> CrestResult<SessionGrant> {
        let device = self
            .registry
            .find_or_create(
                user_id,
                client_handle,
                meta.ip.as_deref(),
                meta.user_agent.as_deref(),
            )
            .await?;
        let hmac = self
            .sessions
            .mint_hmac_session(
                client_handle,
                user_id,
                device.device_id,
                meta.user_agent.as_deref(),
            )
            .await?;
        let refresh_token = self.refresh.issue(client_handle, user_id).await?;
        Ok(SessionGrant {
            user_id,
            device_id: device.device_id,
            hmac,
            refresh_token,
        })
    }
}
