//! User repository — account rows plus the JSON sub-records that live on
//! them (backup codes, credentials, preferences).

use anyhow::Result;
use chrono::Utc;
use crest_common::models::user::{BackupCode, StoredCredential, User};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

/// Ensure a user row exists for `address`; created unverified on first
/// sighting. Returns the row either way.
pub async fn create_if_absent(pool: &SqlitePool, address: &str) -> Result<User> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO users (id, address, verified, active, created_at, updated_at)
        VALUES (?, ?, 0, 1, ?, ?)
        ON CONFLICT (address) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(address)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let user = find_by_address(pool, address)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user row vanished after upsert"))?;
    Ok(user)
}

pub async fn find_by_id(pool: &SqlitePool, user_id: Uuid) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn find_by_address(pool: &SqlitePool, address: &str) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE address = ?")
        .bind(address)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Flip `verified` on. Returns the updated row when the user exists.
pub async fn mark_verified(pool: &SqlitePool, address: &str) -> Result<Option<User>> {
    sqlx::query("UPDATE users SET verified = 1, updated_at = ? WHERE address = ?")
        .bind(Utc::now())
        .bind(address)
        .execute(pool)
        .await?;
    find_by_address(pool, address).await
}

pub async fn set_active(pool: &SqlitePool, user_id: Uuid, active: bool) -> Result<()> {
    sqlx::query("UPDATE users SET active = ?, updated_at = ? WHERE id = ?")
        .bind(active)
        .bind(Utc::now())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update profile fields; `None` leaves a field untouched.
pub async fn update_profile(
    pool: &SqlitePool,
    user_id: Uuid,
    display_handle: Option<&str>,
    short_handle: Option<&str>,
    profile_image: Option<&[u8]>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE users SET
            display_handle = COALESCE(?, display_handle),
            short_handle   = COALESCE(?, short_handle),
            profile_image  = COALESCE(?, profile_image),
            updated_at     = ?
        WHERE id = ?
        "#,
    )
    .bind(display_handle)
    .bind(short_handle)
    .bind(profile_image)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn update_preferences(
    pool: &SqlitePool,
    user_id: Uuid,
    invite: Option<bool>,
    update: Option<bool>,
    cancel: Option<bool>,
    self_invite: Option<bool>,
    rsvp_to_organizer: Option<bool>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE users SET
            invite_email_enabled            = COALESCE(?, invite_email_enabled),
            update_email_enabled            = COALESCE(?, update_email_enabled),
            cancel_email_enabled            = COALESCE(?, cancel_email_enabled),
            self_invite_email_enabled       = COALESCE(?, self_invite_email_enabled),
            rsvp_to_organizer_email_enabled = COALESCE(?, rsvp_to_organizer_email_enabled),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(invite)
    .bind(update)
    .bind(cancel)
    .bind(self_invite)
    .bind(rsvp_to_organizer)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the backup-code list wholesale. Callers read-modify-write inside
/// one serializer closure so concurrent mutations cannot interleave.
pub async fn set_backup_codes(
    pool: &SqlitePool,
    user_id: Uuid,
    codes: &[BackupCode],
    issued: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE users SET backup_codes = ?, backup_codes_issued = ?, updated_at = ? WHERE id = ?",
    )
    .bind(Json(codes))
    .bind(issued)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the credential list wholesale. Same read-modify-write discipline
/// as [`set_backup_codes`].
pub async fn set_credentials(
    pool: &SqlitePool,
    user_id: Uuid,
    credentials: &[StoredCredential],
) -> Result<()> {
    sqlx::query("UPDATE users SET credentials = ?, updated_at = ? WHERE id = ?")
        .bind(Json(credentials))
        .bind(Utc::now())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Hard-delete the account. Devices, pre-keys, sessions, refresh tokens,
/// envelopes, memberships, and role assignments go with it via cascade.
pub async fn delete_account(pool: &SqlitePool, user_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
