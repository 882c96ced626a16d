mod devices;
mod realtime;
mod rollups;

pub use devices::DeviceRef;
pub use rollups::{HourlyAggregate, MinuteTail};

use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

/// MySQL client for the device registry and measurement rollups.
///
/// Owns the worker's only connection pool. Every operation runs inside its
/// own transaction: commit on success, rollback (via drop) on any failure.
pub struct StoreClient {
    pool: MySqlPool,
}

impl StoreClient {
    /// Connect to MySQL and return a client with a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        tracing::info!("Connecting to MySQL");

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let client = Self { pool };
        client.health_check().await?;
        tracing::info!("MySQL connection established");

        Ok(client)
    }

    /// Verify the connection is alive.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Run database migrations. Safe to re-run on every startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Running MySQL migrations");

        sqlx::migrate!("src/store/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::info!("MySQL migrations complete");
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("MySQL connection error: {0}")]
    Connection(String),

    #[error("MySQL query error: {0}")]
    Query(String),

    #[error("MySQL migration error: {0}")]
    Migration(String),
}

impl From<StoreError> for siwatt_common::WorkerError {
    fn from(e: StoreError) -> Self {
        siwatt_common::WorkerError::Database(e.to_string())
    }
}
