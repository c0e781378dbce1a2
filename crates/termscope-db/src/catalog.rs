//! Read-only adapter over the schema catalog tables.
//!
//! The catalog is owned by a separate subsystem: `core_datasource(id, oid)`,
//! `core_table(id, ds_id)` and `core_field(id, table_id, dimension_code)`.
//! Nothing here writes to it.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::debug;

use termscope_core::{CatalogLookup, Error, OrgId, Result};

/// PostgreSQL implementation of CatalogLookup.
#[derive(Clone)]
pub struct PgCatalogLookup {
    pool: Pool<Postgres>,
}

impl PgCatalogLookup {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogLookup for PgCatalogLookup {
    async fn dimension_codes_for_fields(
        &self,
        oid: OrgId,
        field_ids: &[i64],
    ) -> Result<Vec<String>> {
        if field_ids.is_empty() {
            return Ok(Vec::new());
        }
        let codes: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT TRIM(f.dimension_code)
            FROM core_field f
            JOIN core_table t ON t.id = f.table_id
            JOIN core_datasource d ON d.id = t.ds_id
            WHERE d.oid = $1
              AND f.id = ANY($2)
              AND f.dimension_code IS NOT NULL
              AND TRIM(f.dimension_code) <> ''
            ORDER BY 1
            "#,
        )
        .bind(oid)
        .bind(field_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "catalog",
            op = "dimension_codes_for_fields",
            oid,
            input_count = field_ids.len(),
            result_count = codes.len(),
            "Resolved field dimension codes"
        );
        Ok(codes)
    }

    async fn count_fields_using_dimension(&self, oid: OrgId, code: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM core_field f
            JOIN core_table t ON t.id = f.table_id
            JOIN core_datasource d ON d.id = t.ds_id
            WHERE d.oid = $1 AND TRIM(f.dimension_code) = $2
            "#,
        )
        .bind(oid)
        .bind(code.trim())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn existing_datasource_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar("SELECT id FROM core_datasource WHERE oid = $1 AND id = ANY($2) ORDER BY id")
            .bind(oid)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn existing_table_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar(
            r#"
            SELECT t.id
            FROM core_table t
            JOIN core_datasource d ON d.id = t.ds_id
            WHERE d.oid = $1 AND t.id = ANY($2)
            ORDER BY t.id
            "#,
        )
        .bind(oid)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn existing_field_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar(
            r#"
            SELECT f.id
            FROM core_field f
            JOIN core_table t ON t.id = f.table_id
            JOIN core_datasource d ON d.id = t.ds_id
            WHERE d.oid = $1 AND f.id = ANY($2)
            ORDER BY f.id
            "#,
        )
        .bind(oid)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }
}
