use crate::store::{Record, Store, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .context("failed to create lazy database pool")
}

/// Collections live in one JSONB table, keyed by collection name.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id uuid PRIMARY KEY,
                collection text NOT NULL,
                body jsonb NOT NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create documents table")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS documents_collection_created_idx ON documents (collection, created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create documents index")?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn add(&self, collection: &str, record: Record) -> Result<String, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO documents (id, collection, body) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(collection)
            .bind(Json(record))
            .execute(&self.pool)
            .await?;
        Ok(id.to_string())
    }

    async fn query(
        &self,
        collection: &str,
        order_by: &str,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        // Timestamps are stored as fixed-width RFC 3339 UTC text, so text order is time order.
        let rows: Vec<(Json<Record>,)> = sqlx::query_as(
            r#"
            SELECT body
            FROM documents
            WHERE collection = $1
            ORDER BY body ->> $2 DESC NULLS LAST, created_at DESC
            LIMIT $3
            "#,
        )
        .bind(collection)
        .bind(order_by)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(body),)| body).collect())
    }
}
