use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use crate::common::Result;

/// Enrollment sessions that were stopped or dropped; their embeddings, if any
/// made it to disk, are purged by the reconciliation sweep.
#[derive(Clone)]
pub struct CancellationLedger {
    pool: SqlitePool,
}

impl CancellationLedger {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns `true` when this call created the mark; repeats are no-ops.
    pub async fn mark_cancelled(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO cancellation_marks (session_id, created_at) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_cancelled(&self, session_id: &str) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM cancellation_marks WHERE session_id = ?1)",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Oldest first.
    pub async fn list_all_marks(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT session_id FROM cancellation_marks ORDER BY created_at, session_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn clear(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cancellation_marks WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::test_support::temp_store;

    #[tokio::test]
    async fn marking_twice_equals_marking_once() {
        let (store, _dir) = temp_store().await;
        let ledger = store.ledger();

        assert!(ledger.mark_cancelled("s1").await.unwrap());
        assert!(!ledger.mark_cancelled("s1").await.unwrap());

        assert!(ledger.is_cancelled("s1").await.unwrap());
        assert_eq!(ledger.list_all_marks().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn clear_removes_only_that_mark() {
        let (store, _dir) = temp_store().await;
        let ledger = store.ledger();

        ledger.mark_cancelled("s1").await.unwrap();
        ledger.mark_cancelled("s2").await.unwrap();
        ledger.clear("s1").await.unwrap();
        ledger.clear("never-marked").await.unwrap();

        assert!(!ledger.is_cancelled("s1").await.unwrap());
        assert!(ledger.is_cancelled("s2").await.unwrap());
        assert_eq!(ledger.list_all_marks().await.unwrap(), vec!["s2".to_string()]);
    }
}
