//! One-time-code repository. At most one row per address.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crest_common::models::enroll::OneTimeCode;
use sqlx::SqlitePool;

pub async fn find(pool: &SqlitePool, address: &str) -> Result<Option<OneTimeCode>> {
    let row = sqlx::query_as::<_, OneTimeCode>("SELECT * FROM one_time_codes WHERE address = ?")
        .bind(address)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Replace any existing code for the address. Serializer-closure only.
pub async fn replace(
    pool: &SqlitePool,
    address: &str,
    code: &str,
    expires_at: DateTime<Utc>,
) -> Result<OneTimeCode> {
    let row = sqlx::query_as::<_, OneTimeCode>(
        r#"
        INSERT INTO one_time_codes (address, code, created_at, expires_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (address) DO UPDATE SET
            code = excluded.code,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at
        RETURNING *
        "#,
    )
    .bind(address)
    .bind(code)
    .bind(Utc::now())
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete(pool: &SqlitePool, address: &str) -> Result<()> {
    sqlx::query("DELETE FROM one_time_codes WHERE address = ?")
        .bind(address)
        .execute(pool)
        .await?;
    Ok(())
}
