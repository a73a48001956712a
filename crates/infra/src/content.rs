//! Postgres-backed content store over `document_content`.
//!
//! Items are kept per payload reference with their position, so reads return
//! them in the order they were written. `put` replaces a payload's items in
//! one transaction.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use docpipe_core::EntityId;
use docpipe_enrichment::{ContentItem, ContentSource, ContentStore, EnrichmentError};

#[derive(Debug, Clone)]
pub struct PostgresContentStore {
    pool: Arc<PgPool>,
}

impl PostgresContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ContentSource for PostgresContentStore {
    #[instrument(skip(self), err)]
    async fn items(&self, payload_ref: &str) -> Result<Vec<ContentItem>, EnrichmentError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, body
            FROM document_content
            WHERE payload_ref = $1
            ORDER BY position ASC
            "#,
        )
        .bind(payload_ref)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("items", e))?;

        rows.iter()
            .map(|row| {
                let entity_id: Uuid = row
                    .try_get("entity_id")
                    .map_err(|e| map_sqlx_error("items", e))?;
                let body: String = row.try_get("body").map_err(|e| map_sqlx_error("items", e))?;
                Ok(ContentItem::new(EntityId::from_uuid(entity_id), body))
            })
            .collect()
    }
}

#[async_trait]
impl ContentStore for PostgresContentStore {
    #[instrument(skip(self, items), fields(items = items.len()), err)]
    async fn put(&self, payload_ref: &str, items: Vec<ContentItem>) -> Result<(), EnrichmentError> {
        let (positions, entity_ids, bodies) = columns(items)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("put", e))?;

        sqlx::query("DELETE FROM document_content WHERE payload_ref = $1")
            .bind(payload_ref)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("put", e))?;

        sqlx::query(
            r#"
            INSERT INTO document_content (payload_ref, position, entity_id, body, stored_at)
            SELECT $1, t.position, t.entity_id, t.body, NOW()
            FROM UNNEST($2::INTEGER[], $3::UUID[], $4::TEXT[]) AS t (position, entity_id, body)
            "#,
        )
        .bind(payload_ref)
        .bind(&positions)
        .bind(&entity_ids)
        .bind(&bodies)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("put", e))?;
        Ok(())
    }
}

type Columns = (Vec<i32>, Vec<Uuid>, Vec<String>);

/// Split items into the parallel arrays the insert unnests.
fn columns(items: Vec<ContentItem>) -> Result<Columns, EnrichmentError> {
    let mut positions = Vec::with_capacity(items.len());
    let mut entity_ids = Vec::with_capacity(items.len());
    let mut bodies = Vec::with_capacity(items.len());
    for (position, item) in items.into_iter().enumerate() {
        let position = i32::try_from(position)
            .map_err(|_| EnrichmentError::InvalidInput("too many content items".to_string()))?;
        positions.push(position);
        entity_ids.push(*item.entity_id.as_uuid());
        bodies.push(item.text);
    }
    Ok((positions, entity_ids, bodies))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EnrichmentError {
    match err {
        sqlx::Error::Database(db_err) => EnrichmentError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        _ => EnrichmentError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_keep_item_order() {
        let first = ContentItem::new(EntityId::new(), "oak table");
        let second = ContentItem::new(EntityId::new(), "pine shelf");
        let (positions, entity_ids, bodies) =
            columns(vec![first.clone(), second.clone()]).unwrap();

        assert_eq!(positions, vec![0, 1]);
        assert_eq!(
            entity_ids,
            vec![*first.entity_id.as_uuid(), *second.entity_id.as_uuid()]
        );
        assert_eq!(bodies, vec!["oak table", "pine shelf"]);
    }
}
