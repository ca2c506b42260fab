use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::common::{FaceIdError, Result};
use crate::core::recognizer::Embedding;

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the recognition catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub person_id: String,
    pub name: String,
    pub vector: Embedding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrolled {
    pub person_id: String,
    pub count: usize,
}

/// People and the face embeddings that identify them.
#[derive(Clone)]
pub struct IdentityStore {
    pool: SqlitePool,
}

impl IdentityStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Id of the person called `name`, creating them if needed.
    ///
    /// Insert-or-ignore on the unique name followed by a read in the same
    /// transaction, so concurrent callers converge on a single row.
    pub async fn resolve_or_create_person(&self, name: &str) -> Result<String> {
        let mut tx = self.pool.begin().await?;
        let person_id = resolve_or_create_in(&mut tx, name).await?;
        tx.commit().await?;
        Ok(person_id)
    }

    /// Inserts every vector for `session_id` or none of them.
    pub async fn commit_embeddings(
        &self,
        person_id: &str,
        session_id: &str,
        vectors: &[Embedding],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        insert_embeddings_in(&mut tx, person_id, session_id, vectors).await?;
        tx.commit().await?;
        Ok(vectors.len())
    }

    /// Resolve-or-create plus the embedding insert as a single unit.
    pub async fn enroll(
        &self,
        name: &str,
        session_id: &str,
        vectors: &[Embedding],
    ) -> Result<Enrolled> {
        let mut tx = self.pool.begin().await?;
        let person_id = resolve_or_create_in(&mut tx, name).await?;
        insert_embeddings_in(&mut tx, &person_id, session_id, vectors).await?;
        tx.commit().await?;

        tracing::info!(%person_id, session_id, count = vectors.len(), "embeddings committed");
        Ok(Enrolled { person_id, count: vectors.len() })
    }

    /// The whole catalog in insertion order.
    pub async fn list_all_embeddings(&self) -> Result<Vec<CatalogEntry>> {
        let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
            "
            SELECT p.id, p.name, e.vector
            FROM face_embeddings e
            JOIN people p ON p.id = e.person_id
            ORDER BY e.rowid
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(person_id, name, blob)| {
                Ok(CatalogEntry { person_id, name, vector: decode_vector(&blob)? })
            })
            .collect()
    }

    /// Removes the session's embeddings and returns the people they belonged to.
    pub async fn delete_embeddings_for_session(&self, session_id: &str) -> Result<BTreeSet<String>> {
        let person_ids: Vec<String> = sqlx::query_scalar(
            "DELETE FROM face_embeddings WHERE session_id = ?1 RETURNING person_id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(person_ids.into_iter().collect())
    }

    /// Deletes the person only if no embedding references them.
    pub async fn delete_person_if_empty(&self, person_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "
            DELETE FROM people
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM face_embeddings WHERE person_id = ?1)
            ",
        )
        .bind(person_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Embeddings whose person no longer exists.
    pub async fn delete_orphaned_embeddings(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM face_embeddings WHERE person_id NOT IN (SELECT id FROM people)",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn person_by_name(&self, name: &str) -> Result<Option<Person>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, name, created_at FROM people WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id, name, created_at)| {
            Ok(Person { id, name, created_at: parse_timestamp(&created_at)? })
        })
        .transpose()
    }

    pub async fn embedding_count_for_session(&self, session_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM face_embeddings WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn embedding_count_for_person(&self, person_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM face_embeddings WHERE person_id = ?1")
            .bind(person_id)
            .fetch_one(&self.pool)
            .await?)
    }
}

async fn resolve_or_create_in(conn: &mut SqliteConnection, name: &str) -> Result<String> {
    sqlx::query(
        "INSERT INTO people (id, name, created_at) VALUES (?1, ?2, ?3) ON CONFLICT(name) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(name)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    let person_id: String = sqlx::query_scalar("SELECT id FROM people WHERE name = ?1")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;

    Ok(person_id)
}

async fn insert_embeddings_in(
    conn: &mut SqliteConnection,
    person_id: &str,
    session_id: &str,
    vectors: &[Embedding],
) -> Result<()> {
    let created_at = Utc::now().to_rfc3339();
    for vector in vectors {
        sqlx::query(
            "
            INSERT INTO face_embeddings (id, person_id, vector, session_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(person_id)
        .bind(encode_vector(vector)?)
        .bind(session_id)
        .bind(&created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn encode_vector(vector: &Embedding) -> Result<Vec<u8>> {
    bincode::serialize(vector)
        .map_err(|e| FaceIdError::Storage(format!("Failed to serialize embedding: {}", e)))
}

fn decode_vector(blob: &[u8]) -> Result<Embedding> {
    bincode::deserialize(blob)
        .map_err(|e| FaceIdError::Storage(format!("Failed to deserialize embedding: {}", e)))
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| FaceIdError::Storage(format!("Invalid timestamp {:?}: {}", value, e)))
}
