//! # crest-db
//!
//! Database layer for Crest: an embedded SQLite store fronted by the
//! [`serializer::WriteSerializer`]. Every state mutation is submitted as a
//! closure to the serializer's FIFO; read queries go straight to the pool
//! and run concurrently.

pub mod fanout;
pub mod prekeystore;
pub mod repository;
pub mod serializer;

use anyhow::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use serializer::WriteSerializer;

/// Shared database state passed through Axum extractors.
#[derive(Clone)]
pub struct Database {
    /// Read pool. Mutations must go through [`Database::writer`].
    pub pool: SqlitePool,
    /// Single-writer FIFO for all state mutations.
    pub writer: WriteSerializer,
}

impl Database {
    /// Connect using the URL in `config.database.url`, run migrations, and
    /// spawn the write serializer worker.
    pub async fn connect(config: &crest_common::config::AppConfig) -> Result<Self> {
        tracing::info!("Connecting to SQLite: {}", &config.database.url);
        let options = SqliteConnectOptions::from_str(&config.database.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect_with(options)
            .await?;

        tracing::info!("Running database migrations…");
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Migrations complete");

        let writer = WriteSerializer::spawn(
            pool.clone(),
            Duration::from_secs(config.serializer.default_deadline_secs),
        );

        Ok(Self { pool, writer })
    }

    /// In-memory database for tests. Single connection so the store is shared.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let writer = WriteSerializer::spawn(pool.clone(), Duration::from_secs(5));
        Ok(Self { pool, writer })
    }
}
