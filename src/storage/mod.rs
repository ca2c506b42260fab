//! Durable state: people, their face embeddings, and cancelled enrollment
//! sessions, all in one SQLite database behind a bounded connection pool.

pub mod identity;
pub mod ledger;

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};

use crate::common::config::DatabaseConfig;
use crate::common::{FaceIdError, Result};

pub use identity::{CatalogEntry, Enrolled, IdentityStore, Person};
pub use ledger::CancellationLedger;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_schema.sql");

/// Owner of the connection pool.
///
/// Built once at startup and closed explicitly at shutdown; components get
/// cheap clones and check a connection out per operation.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path, config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(
            path = %path.display(),
            max_connections = config.max_connections,
            "database ready"
        );
        Ok(store)
    }

    pub async fn schema_version(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await?;

        if current > SCHEMA_VERSION {
            return Err(FaceIdError::Storage(format!(
                "unsupported schema version {}, max supported {}",
                current, SCHEMA_VERSION
            )));
        }

        if current < 1 {
            sqlx::raw_sql(SCHEMA_SQL).execute(&mut *conn).await?;
            sqlx::query("PRAGMA user_version = 1").execute(&mut *conn).await?;
            tracing::info!("database schema created");
        }

        Ok(())
    }

    pub fn identity(&self) -> IdentityStore {
        IdentityStore::new(self.pool.clone())
    }

    pub fn ledger(&self) -> CancellationLedger {
        CancellationLedger::new(self.pool.clone())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Waits for checked-out connections to come back, then closes them all.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database connection pool closed");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    #[tokio::test]
    async fn open_creates_schema_and_is_idempotent() {
        let (store, dir) = temp_store().await;
        assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
        store.health_check().await.unwrap();
        store.close().await;

        let reopened = Store::open(&dir.path().join("faceid.db"), &DatabaseConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.schema_version().await.unwrap(), SCHEMA_VERSION);
        reopened.close().await;
    }

    #[tokio::test]
    async fn newer_schema_is_refused() {
        let (store, _dir) = temp_store().await;
        sqlx::query("PRAGMA user_version = 99")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(store.migrate().await, Err(FaceIdError::Storage(_))));
    }
}
