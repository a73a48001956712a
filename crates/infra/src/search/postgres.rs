//! `pgvector`-backed vector store over `entity_vectors`.
//!
//! Similarity is `1 - (embedding <=> query)`, i.e. cosine similarity derived
//! from pgvector's cosine distance operator.

use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use docpipe_core::EntityId;

use super::vectors::{SpaceHit, VectorRecord, VectorStore, VectorStoreError};

#[derive(Debug, Clone)]
pub struct PgVectorStore {
    pool: Arc<PgPool>,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn space_dimension(&self, space_name: &str) -> Result<Option<usize>, VectorStoreError> {
        let row = sqlx::query("SELECT dimension FROM vector_spaces WHERE space_name = $1")
            .bind(space_name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("space_dimension", e))?;

        row.map(|r| {
            r.try_get::<i32, _>("dimension")
                .map(|d| d.max(0) as usize)
                .map_err(|e| map_sqlx_error("space_dimension", e))
        })
        .transpose()
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    #[instrument(skip(self, record), fields(entity_id = %record.entity_id, space = %record.space_name), err)]
    async fn upsert(&self, record: VectorRecord) -> Result<(), VectorStoreError> {
        if record.vector.is_empty() {
            return Err(VectorStoreError::EmptyVector(record.space_name));
        }
        // The space row fixes the dimension; its row lock serialises first writers,
        // and the vector is only written when the dimensions agree.
        let dimension = record.dimension() as i32;
        let row = sqlx::query(
            r#"
            WITH space AS (
                INSERT INTO vector_spaces (space_name, dimension)
                VALUES ($2, $3)
                ON CONFLICT (space_name) DO UPDATE SET space_name = EXCLUDED.space_name
                RETURNING dimension
            ),
            written AS (
                INSERT INTO entity_vectors (entity_id, space_name, dimension, embedding, updated_at)
                SELECT $1, $2, $3, $4, NOW()
                FROM space
                WHERE space.dimension = $3
                ON CONFLICT (entity_id, space_name) DO UPDATE
                SET dimension = EXCLUDED.dimension,
                    embedding = EXCLUDED.embedding,
                    updated_at = EXCLUDED.updated_at
                RETURNING 1
            )
            SELECT (SELECT dimension FROM space) AS expected,
                   EXISTS (SELECT 1 FROM written) AS written
            "#,
        )
        .bind(record.entity_id.as_uuid())
        .bind(&record.space_name)
        .bind(dimension)
        .bind(Vector::from(record.vector))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        let expected: i32 = row
            .try_get("expected")
            .map_err(|e| map_sqlx_error("upsert", e))?;
        let written: bool = row
            .try_get("written")
            .map_err(|e| map_sqlx_error("upsert", e))?;
        upsert_outcome(&record.space_name, expected, dimension, written)
    }

    #[instrument(skip(self), fields(entity_id = %entity_id), err)]
    async fn get(
        &self,
        entity_id: EntityId,
        space_name: &str,
    ) -> Result<Option<VectorRecord>, VectorStoreError> {
        let row = sqlx::query(
            "SELECT entity_id, space_name, embedding FROM entity_vectors \
             WHERE entity_id = $1 AND space_name = $2",
        )
        .bind(entity_id.as_uuid())
        .bind(space_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_record(&r)).transpose()
    }

    #[instrument(skip(self, query), fields(space = space_name, limit), err)]
    async fn nearest(
        &self,
        space_name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SpaceHit>, VectorStoreError> {
        let Some(expected) = self.space_dimension(space_name).await? else {
            return Ok(Vec::new());
        };
        if expected != query.len() {
            return Err(VectorStoreError::DimensionMismatch {
                space: space_name.to_string(),
                expected,
                got: query.len(),
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT entity_id, 1 - (embedding <=> $2) AS similarity
            FROM entity_vectors
            WHERE space_name = $1
            ORDER BY embedding <=> $2 ASC, entity_id ASC
            LIMIT $3
            "#,
        )
        .bind(space_name)
        .bind(Vector::from(query.to_vec()))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("nearest", e))?;

        rows.iter()
            .map(|row| {
                let entity_id: Uuid = row
                    .try_get("entity_id")
                    .map_err(|e| map_sqlx_error("nearest", e))?;
                let similarity: f64 = row
                    .try_get("similarity")
                    .map_err(|e| map_sqlx_error("nearest", e))?;
                Ok(SpaceHit {
                    entity_id: EntityId::from_uuid(entity_id),
                    similarity,
                })
            })
            .collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> VectorStoreError {
    match err {
        sqlx::Error::Database(db_err) => VectorStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        _ => VectorStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Map the upsert statement's result onto the store contract.
fn upsert_outcome(
    space: &str,
    expected: i32,
    got: i32,
    written: bool,
) -> Result<(), VectorStoreError> {
    if written {
        return Ok(());
    }
    if expected != got {
        return Err(VectorStoreError::DimensionMismatch {
            space: space.to_string(),
            expected: expected.max(0) as usize,
            got: got.max(0) as usize,
        });
    }
    Err(VectorStoreError::Storage(format!(
        "vector for space {space} was not written"
    )))
}

fn decode_record(row: &PgRow) -> Result<VectorRecord, VectorStoreError> {
    let entity_id: Uuid = row
        .try_get("entity_id")
        .map_err(|e| map_sqlx_error("decode_record", e))?;
    let space_name: String = row
        .try_get("space_name")
        .map_err(|e| map_sqlx_error("decode_record", e))?;
    let embedding: Vector = row
        .try_get("embedding")
        .map_err(|e| map_sqlx_error("decode_record", e))?;
    Ok(VectorRecord::new(
        EntityId::from_uuid(entity_id),
        space_name,
        embedding.to_vec(),
    ))
}
