//! Dimension value set repository implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info};

use termscope_core::{
    apply_dimension_update, DimensionFilter, DimensionRepository, DimensionSummary,
    DimensionValueSet, EntityKind, Error, ForbiddenReason, NewDimension, OrgId, Page,
    PageRequest, Result, UpdateDimensionRequest, UserId,
};

use crate::{contains_pattern, is_unique_violation};

const DIMENSION_COLUMNS: &str = r#"id, oid, name, code, description, "values", value_labels,
    is_system, enabled, create_time, update_time, create_by, update_by"#;

/// PostgreSQL implementation of DimensionRepository.
#[derive(Clone)]
pub struct PgDimensionRepository {
    pool: Pool<Postgres>,
}

impl PgDimensionRepository {
    /// Create a new PgDimensionRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        oid: OrgId,
        id: i64,
    ) -> Result<DimensionValueSet> {
        let sql = format!(
            "SELECT {} FROM dimension_value WHERE oid = $1 AND id = $2 FOR UPDATE",
            DIMENSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(oid)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::not_found(EntityKind::Dimension, id))?;
        row_to_dimension(&row)
    }

    async fn code_taken(
        tx: &mut Transaction<'_, Postgres>,
        oid: OrgId,
        code: &str,
        exclude_id: Option<i64>,
    ) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM dimension_value
                WHERE oid = $1 AND code = $2 AND ($3::bigint IS NULL OR id <> $3)
            )
            "#,
        )
        .bind(oid)
        .bind(code)
        .bind(exclude_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(taken)
    }
}

fn row_to_dimension(row: &PgRow) -> Result<DimensionValueSet> {
    let values: Json<Vec<String>> = row
        .try_get("values")
        .map_err(|e| Error::Serialization(format!("dimension_value.values: {}", e)))?;
    let labels: Option<Json<BTreeMap<String, String>>> = row
        .try_get("value_labels")
        .map_err(|e| Error::Serialization(format!("dimension_value.value_labels: {}", e)))?;

    Ok(DimensionValueSet {
        id: row.get("id"),
        oid: row.get("oid"),
        name: row.get("name"),
        code: row.get("code"),
        description: row.get("description"),
        values: values.0,
        value_labels: labels.map(|l| l.0).unwrap_or_default(),
        is_system: row.get("is_system"),
        enabled: row.get("enabled"),
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
        create_by: row.get("create_by"),
        update_by: row.get("update_by"),
    })
}

/// Map a unique-index violation on `(oid, code)` to a conflict.
fn map_write_error(err: sqlx::Error, code: &str) -> Error {
    if is_unique_violation(&err) {
        Error::duplicate(EntityKind::Dimension, "code", code)
    } else {
        Error::Database(err)
    }
}

struct FilterClause {
    sql: String,
    name: Option<String>,
    code: Option<String>,
    enabled: Option<bool>,
}

impl FilterClause {
    fn build(filter: &DimensionFilter) -> Self {
        let name = contains_pattern(filter.name.as_deref());
        let code = contains_pattern(filter.code.as_deref());
        let mut conditions = vec!["oid = $1".to_string()];
        let mut param = 2;
        if name.is_some() {
            conditions.push(format!("name ILIKE ${}", param));
            param += 1;
        }
        if code.is_some() {
            conditions.push(format!("code ILIKE ${}", param));
            param += 1;
        }
        if filter.enabled.is_some() {
            conditions.push(format!("enabled = ${}", param));
        }
        Self {
            sql: conditions.join(" AND "),
            name,
            code,
            enabled: filter.enabled,
        }
    }

    fn bind<'q>(
        &'q self,
        mut q: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        if let Some(name) = &self.name {
            q = q.bind(name);
        }
        if let Some(code) = &self.code {
            q = q.bind(code);
        }
        if let Some(enabled) = self.enabled {
            q = q.bind(enabled);
        }
        q
    }
}

#[async_trait]
impl DimensionRepository for PgDimensionRepository {
    async fn list(
        &self,
        oid: OrgId,
        filter: &DimensionFilter,
        page: PageRequest,
    ) -> Result<Page<DimensionValueSet>> {
        let clause = FilterClause::build(filter);

        let count_sql = format!(
            "SELECT COUNT(*) FROM dimension_value WHERE {}",
            clause.sql
        );
        let total: i64 = {
            let q = clause.bind(sqlx::query(&count_sql).bind(oid));
            q.fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?
                .get(0)
        };

        let window = page.window(total);
        let list_sql = format!(
            "SELECT {} FROM dimension_value WHERE {} ORDER BY create_time DESC, id DESC LIMIT {} OFFSET {}",
            DIMENSION_COLUMNS,
            clause.sql,
            window.page_size,
            window.offset()
        );
        let rows = clause
            .bind(sqlx::query(&list_sql).bind(oid))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let items = rows
            .iter()
            .map(row_to_dimension)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            subsystem = "db",
            component = "dimensions",
            op = "list",
            oid,
            total_count = total,
            result_count = items.len(),
            "Listed dimensions"
        );
        Ok(Page::new(items, window, total))
    }

    async fn get(&self, oid: OrgId, id: i64) -> Result<Option<DimensionValueSet>> {
        let sql = format!(
            "SELECT {} FROM dimension_value WHERE oid = $1 AND id = $2",
            DIMENSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(oid)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(row_to_dimension).transpose()
    }

    async fn list_all(&self, oid: OrgId, enabled_only: bool) -> Result<Vec<DimensionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, code, description, enabled,
                   COALESCE(jsonb_array_length("values"), 0)::bigint AS value_count
            FROM dimension_value
            WHERE oid = $1 AND ($2 = FALSE OR enabled = TRUE)
            ORDER BY name ASC, id ASC
            "#,
        )
        .bind(oid)
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| DimensionSummary {
                id: row.get("id"),
                name: row.get("name"),
                code: row.get("code"),
                description: row.get("description"),
                enabled: row.get("enabled"),
                value_count: row.get::<i64, _>("value_count").max(0) as usize,
            })
            .collect())
    }

    async fn find_by_codes(&self, oid: OrgId, codes: &[String]) -> Result<Vec<DimensionValueSet>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM dimension_value WHERE oid = $1 AND enabled = TRUE AND code = ANY($2) ORDER BY name ASC, id ASC",
            DIMENSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(oid)
            .bind(codes)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.iter().map(row_to_dimension).collect()
    }

    async fn create(&self, oid: OrgId, new: &NewDimension, actor: UserId) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if Self::code_taken(&mut tx, oid, &new.code, None).await? {
            return Err(Error::duplicate(EntityKind::Dimension, "code", &new.code));
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dimension_value
                (oid, name, code, description, "values", value_labels, is_system, enabled, create_time, create_by)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(oid)
        .bind(&new.name)
        .bind(&new.code)
        .bind(&new.description)
        .bind(Json(&new.values))
        .bind(Json(&new.value_labels))
        .bind(new.enabled)
        .bind(Utc::now())
        .bind(actor)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &new.code))?;

        tx.commit().await.map_err(|e| map_write_error(e, &new.code))?;

        info!(
            subsystem = "db",
            component = "dimensions",
            op = "create",
            oid,
            dimension_id = id,
            actor,
            "Dimension created"
        );
        Ok(id)
    }

    async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateDimensionRequest,
        actor: UserId,
    ) -> Result<DimensionValueSet> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let existing = Self::lock_row(&mut tx, oid, id).await?;
        let change = apply_dimension_update(&existing, req, actor, Utc::now())?;
        let updated = change.updated;

        if change.code_changed && Self::code_taken(&mut tx, oid, &updated.code, Some(id)).await? {
            return Err(Error::duplicate(
                EntityKind::Dimension,
                "code",
                &updated.code,
            ));
        }

        sqlx::query(
            r#"
            UPDATE dimension_value
            SET name = $1, code = $2, description = $3, "values" = $4, value_labels = $5,
                enabled = $6, update_time = $7, update_by = $8
            WHERE oid = $9 AND id = $10
            "#,
        )
        .bind(&updated.name)
        .bind(&updated.code)
        .bind(&updated.description)
        .bind(Json(&updated.values))
        .bind(Json(&updated.value_labels))
        .bind(updated.enabled)
        .bind(updated.update_time)
        .bind(updated.update_by)
        .bind(oid)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &updated.code))?;

        tx.commit()
            .await
            .map_err(|e| map_write_error(e, &updated.code))?;

        info!(
            subsystem = "db",
            component = "dimensions",
            op = "update",
            oid,
            dimension_id = id,
            actor,
            code_changed = change.code_changed,
            "Dimension updated"
        );
        Ok(updated)
    }

    async fn delete(&self, oid: OrgId, id: i64) -> Result<DimensionValueSet> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let existing = Self::lock_row(&mut tx, oid, id).await?;
        if existing.is_system {
            return Err(Error::Forbidden {
                entity: EntityKind::Dimension,
                id,
                reason: ForbiddenReason::SystemEntryDelete,
            });
        }

        sqlx::query("DELETE FROM dimension_value WHERE oid = $1 AND id = $2")
            .bind(oid)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "dimensions",
            op = "delete",
            oid,
            dimension_id = id,
            code = %existing.code,
            "Dimension deleted"
        );
        Ok(existing)
    }

    async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool, actor: UserId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dimension_value
            SET enabled = $1, update_time = $2, update_by = $3
            WHERE oid = $4 AND id = $5
            "#,
        )
        .bind(enabled)
        .bind(Utc::now())
        .bind(actor)
        .bind(oid)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(EntityKind::Dimension, id));
        }

        info!(
            subsystem = "db",
            component = "dimensions",
            op = "set_enabled",
            oid,
            dimension_id = id,
            enabled,
            actor,
            "Dimension enabled flag set"
        );
        Ok(())
    }

    async fn seed_system(&self, oid: OrgId, seeds: &[NewDimension]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let now = Utc::now();
        let mut inserted = 0usize;

        for seed in seeds {
            let result = sqlx::query(
                r#"
                INSERT INTO dimension_value
                    (oid, name, code, description, "values", value_labels, is_system, enabled, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8)
                ON CONFLICT (oid, code) DO NOTHING
                "#,
            )
            .bind(oid)
            .bind(&seed.name)
            .bind(&seed.code)
            .bind(&seed.description)
            .bind(Json(&seed.values))
            .bind(Json(&seed.value_labels))
            .bind(seed.enabled)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "dimensions",
            op = "seed_system",
            oid,
            input_count = seeds.len(),
            inserted,
            "System dimensions seeded"
        );
        Ok(inserted)
    }
}
