use std::str::FromStr;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};

use crate::config::DatabaseConfig;
use crate::error::BuildError;
use crate::models::ConnectionType;
use crate::registry::Footprint;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Live connection to a session's queryable store. Never serialized; it only
/// ever lives inside the object registry.
#[derive(Debug, Clone)]
pub enum StoreConnection {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl StoreConnection {
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            Self::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            Self::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Sqlite(pool) => pool.close().await,
            Self::Postgres(pool) => pool.close().await,
        }
    }
}

impl Footprint for StoreConnection {
    fn approx_bytes(&self) -> u64 {
        // pooled connections dominate; a sqlite page cache is ~2 MiB by default
        match self {
            Self::Sqlite(pool) => u64::from(pool.size()) * 2 * 1024 * 1024,
            Self::Postgres(pool) => u64::from(pool.size()) * 64 * 1024,
        }
    }
}

/// Open the store named by `descriptor` and check it once.
///
/// Session-local CSV uploads live in a SQLite file that the ingestion pipeline
/// fills; the file is created empty if ingestion has not run yet.
pub async fn open_store(
    connection_type: ConnectionType,
    descriptor: &str,
) -> Result<StoreConnection, BuildError> {
    let store = match connection_type {
        ConnectionType::Csv => {
            let options = SqliteConnectOptions::from_str(descriptor)
                .map_err(BuildError::failed)?
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await
                .map_err(BuildError::failed)?;
            StoreConnection::Sqlite(pool)
        }
        ConnectionType::Postgresql => {
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .connect(descriptor)
                .await
                .map_err(BuildError::failed)?;
            StoreConnection::Postgres(pool)
        }
    };

    if let Err(e) = store.ping().await {
        store.close().await;
        return Err(BuildError::failed(e));
    }
    Ok(store)
}
