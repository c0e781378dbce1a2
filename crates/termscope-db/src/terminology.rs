//! Terminology repository implementation.
//!
//! Each entry is a parent row plus one child row per synonym (`pid` set).
//! Children copy the parent's description, scope and associations so that
//! every row can be gated and ranked on its own.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use termscope_core::{
    plan_terminology_update, EmbeddingTarget, EntityKind, Error, NewTerminology, OrgId, Page,
    PageRequest, QueryContext, Result, TermScope, TerminologyEntry,
    TerminologyFilter, TerminologyInfo, TerminologyRepository, TerminologyUpdate,
    UpdateTerminologyRequest,
};

use crate::contains_pattern;

const TERMINOLOGY_COLUMNS: &str = "id, oid, pid, word, description, embedding, scope, \
    datasource_ids, table_ids, field_ids, enabled, create_time";

/// PostgreSQL implementation of TerminologyRepository.
#[derive(Clone)]
pub struct PgTerminologyRepository {
    pool: Pool<Postgres>,
}

impl PgTerminologyRepository {
    /// Create a new PgTerminologyRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn lock_parent(
        tx: &mut Transaction<'_, Postgres>,
        oid: OrgId,
        id: i64,
    ) -> Result<TerminologyEntry> {
        let sql = format!(
            "SELECT {} FROM terminology WHERE oid = $1 AND id = $2 AND pid IS NULL FOR UPDATE",
            TERMINOLOGY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(oid)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::not_found(EntityKind::Terminology, id))?;
        row_to_entry(&row)
    }

    async fn children_of(&self, oid: OrgId, parent_ids: &[i64]) -> Result<Vec<TerminologyEntry>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM terminology WHERE oid = $1 AND pid = ANY($2) ORDER BY id",
            TERMINOLOGY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(oid)
            .bind(parent_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Insert synonym rows sharing the parent's attributes.
    async fn insert_synonyms(
        tx: &mut Transaction<'_, Postgres>,
        parent: &TerminologyEntry,
        words: &[String],
    ) -> Result<()> {
        for word in words {
            sqlx::query(
                r#"
                INSERT INTO terminology
                    (oid, pid, word, description, scope, datasource_ids, table_ids, field_ids, enabled, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(parent.oid)
            .bind(parent.id)
            .bind(word)
            .bind(&parent.description)
            .bind(parent.scope.as_str())
            .bind(parent.datasource_ids.as_ref().map(Json))
            .bind(parent.table_ids.as_ref().map(Json))
            .bind(parent.field_ids.as_ref().map(Json))
            .bind(parent.enabled)
            .bind(parent.create_time)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        }
        Ok(())
    }
}

fn id_list(row: &PgRow, column: &str) -> Result<Option<Vec<i64>>> {
    let value: Option<Json<Vec<i64>>> = row
        .try_get(column)
        .map_err(|e| Error::Serialization(format!("terminology.{}: {}", column, e)))?;
    Ok(value.map(|v| v.0))
}

fn row_to_entry(row: &PgRow) -> Result<TerminologyEntry> {
    let scope: String = row.get("scope");
    let scope = scope
        .parse::<TermScope>()
        .map_err(Error::Serialization)?;

    Ok(TerminologyEntry {
        id: row.get("id"),
        oid: row.get("oid"),
        pid: row.get("pid"),
        word: row.get("word"),
        description: row.get("description"),
        embedding: row.get::<Option<Vector>, _>("embedding"),
        scope,
        datasource_ids: id_list(row, "datasource_ids")?,
        table_ids: id_list(row, "table_ids")?,
        field_ids: id_list(row, "field_ids")?,
        enabled: row.get("enabled"),
        create_time: row.get("create_time"),
    })
}

fn row_to_target(row: &PgRow) -> EmbeddingTarget {
    EmbeddingTarget {
        id: row.get("id"),
        oid: row.get("oid"),
        word: row.get("word"),
        description: row.get("description"),
    }
}

struct FilterClause {
    sql: String,
    word: Option<String>,
    scope: Option<TermScope>,
    enabled: Option<bool>,
}

impl FilterClause {
    fn build(filter: &TerminologyFilter) -> Self {
        let word = contains_pattern(filter.word.as_deref());
        let mut conditions = vec!["t.oid = $1".to_string(), "t.pid IS NULL".to_string()];
        let mut param = 2;
        if word.is_some() {
            conditions.push(format!(
                "(t.word ILIKE ${p} OR EXISTS (SELECT 1 FROM terminology c WHERE c.pid = t.id AND c.word ILIKE ${p}))",
                p = param
            ));
            param += 1;
        }
        if filter.scope.is_some() {
            conditions.push(format!("t.scope = ${}", param));
            param += 1;
        }
        if filter.enabled.is_some() {
            conditions.push(format!("t.enabled = ${}", param));
        }
        Self {
            sql: conditions.join(" AND "),
            word,
            scope: filter.scope,
            enabled: filter.enabled,
        }
    }

    fn bind<'q>(
        &'q self,
        mut q: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        if let Some(word) = &self.word {
            q = q.bind(word);
        }
        if let Some(scope) = self.scope {
            q = q.bind(scope.as_str());
        }
        if let Some(enabled) = self.enabled {
            q = q.bind(enabled);
        }
        q
    }
}

fn group_infos(parents: &[TerminologyEntry], children: &[TerminologyEntry]) -> Vec<TerminologyInfo> {
    let mut by_parent: HashMap<i64, Vec<TerminologyEntry>> = HashMap::new();
    for child in children {
        if let Some(pid) = child.pid {
            by_parent.entry(pid).or_default().push(child.clone());
        }
    }
    parents
        .iter()
        .map(|p| {
            let synonyms = by_parent.get(&p.id).map(Vec::as_slice).unwrap_or_default();
            TerminologyInfo::from_group(p, synonyms)
        })
        .collect()
}

#[async_trait]
impl TerminologyRepository for PgTerminologyRepository {
    async fn list(
        &self,
        oid: OrgId,
        filter: &TerminologyFilter,
        page: PageRequest,
    ) -> Result<Page<TerminologyInfo>> {
        let clause = FilterClause::build(filter);

        let count_sql = format!("SELECT COUNT(*) FROM terminology t WHERE {}", clause.sql);
        let total: i64 = clause
            .bind(sqlx::query(&count_sql).bind(oid))
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?
            .get(0);

        let window = page.window(total);
        let columns = TERMINOLOGY_COLUMNS
            .split(", ")
            .map(|c| format!("t.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let list_sql = format!(
            "SELECT {} FROM terminology t WHERE {} ORDER BY t.create_time DESC, t.id DESC LIMIT {} OFFSET {}",
            columns,
            clause.sql,
            window.page_size,
            window.offset()
        );
        let rows = clause
            .bind(sqlx::query(&list_sql).bind(oid))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let parents = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;

        let parent_ids: Vec<i64> = parents.iter().map(|p| p.id).collect();
        let children = self.children_of(oid, &parent_ids).await?;
        let items = group_infos(&parents, &children);

        debug!(
            subsystem = "db",
            component = "terminology",
            op = "list",
            oid,
            total_count = total,
            result_count = items.len(),
            "Listed terminology"
        );
        Ok(Page::new(items, window, total))
    }

    async fn get(&self, oid: OrgId, id: i64) -> Result<Option<TerminologyInfo>> {
        let sql = format!(
            "SELECT {} FROM terminology WHERE oid = $1 AND id = $2 AND pid IS NULL",
            TERMINOLOGY_COLUMNS
        );
        let Some(row) = sqlx::query(&sql)
            .bind(oid)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
        else {
            return Ok(None);
        };
        let parent = row_to_entry(&row)?;
        let children = self.children_of(oid, &[id]).await?;
        Ok(Some(TerminologyInfo::from_group(&parent, &children)))
    }

    async fn create(&self, oid: OrgId, new: &NewTerminology) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let binding = &new.binding;
        let now = Utc::now();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO terminology
                (oid, word, description, scope, datasource_ids, table_ids, field_ids, enabled, create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(oid)
        .bind(&new.word)
        .bind(&new.description)
        .bind(binding.scope().as_str())
        .bind(Json(binding.datasource_ids()))
        .bind(Json(binding.table_ids()))
        .bind(Json(binding.field_ids()))
        .bind(new.enabled)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let parent = TerminologyEntry {
            id,
            oid,
            pid: None,
            word: new.word.clone(),
            description: new.description.clone(),
            embedding: None,
            scope: binding.scope(),
            datasource_ids: Some(binding.datasource_ids()),
            table_ids: Some(binding.table_ids()),
            field_ids: Some(binding.field_ids()),
            enabled: new.enabled,
            create_time: now,
        };
        Self::insert_synonyms(&mut tx, &parent, &new.other_words).await?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "terminology",
            op = "create",
            oid,
            entry_id = id,
            scope = %binding.scope(),
            synonym_count = new.other_words.len(),
            "Terminology entry created"
        );
        Ok(id)
    }

    async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateTerminologyRequest,
    ) -> Result<TerminologyUpdate> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let existing = Self::lock_parent(&mut tx, oid, id).await?;
        let change = plan_terminology_update(&existing, req)?;
        let description_changed = change.description != existing.description;

        let (scope, ds, tables, fields) = match &change.binding {
            Some(b) => (
                b.scope(),
                Some(b.datasource_ids()),
                Some(b.table_ids()),
                Some(b.field_ids()),
            ),
            None => (
                existing.scope,
                existing.datasource_ids.clone(),
                existing.table_ids.clone(),
                existing.field_ids.clone(),
            ),
        };

        sqlx::query(
            r#"
            UPDATE terminology
            SET word = $1, description = $2, scope = $3, datasource_ids = $4, table_ids = $5,
                field_ids = $6, enabled = $7,
                embedding = CASE WHEN $8 THEN NULL ELSE embedding END
            WHERE oid = $9 AND id = $10
            "#,
        )
        .bind(&change.word)
        .bind(&change.description)
        .bind(scope.as_str())
        .bind(ds.as_ref().map(Json))
        .bind(tables.as_ref().map(Json))
        .bind(fields.as_ref().map(Json))
        .bind(change.enabled)
        .bind(change.embedding_invalidated)
        .bind(oid)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        // Synonyms share everything but the word; their text only changes
        // with the description.
        sqlx::query(
            r#"
            UPDATE terminology
            SET description = $1, scope = $2, datasource_ids = $3, table_ids = $4,
                field_ids = $5, enabled = $6,
                embedding = CASE WHEN $7 THEN NULL ELSE embedding END
            WHERE oid = $8 AND pid = $9
            "#,
        )
        .bind(&change.description)
        .bind(scope.as_str())
        .bind(ds.as_ref().map(Json))
        .bind(tables.as_ref().map(Json))
        .bind(fields.as_ref().map(Json))
        .bind(change.enabled)
        .bind(description_changed)
        .bind(oid)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if let Some(word) = &change.retired_synonym {
            sqlx::query("DELETE FROM terminology WHERE oid = $1 AND pid = $2 AND word = $3")
                .bind(oid)
                .bind(id)
                .bind(word)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        let mut added = 0usize;
        if let Some(words) = &change.other_words {
            sqlx::query("DELETE FROM terminology WHERE oid = $1 AND pid = $2 AND NOT (word = ANY($3))")
                .bind(oid)
                .bind(id)
                .bind(words)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            let kept: Vec<String> =
                sqlx::query_scalar("SELECT word FROM terminology WHERE oid = $1 AND pid = $2")
                    .bind(oid)
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
            let missing: Vec<String> = words
                .iter()
                .filter(|w| !kept.contains(w))
                .cloned()
                .collect();
            added = missing.len();

            let parent = TerminologyEntry {
                word: change.word.clone(),
                description: change.description.clone(),
                scope,
                datasource_ids: ds.clone(),
                table_ids: tables.clone(),
                field_ids: fields.clone(),
                enabled: change.enabled,
                ..existing.clone()
            };
            Self::insert_synonyms(&mut tx, &parent, &missing).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        let embedding_invalidated = change.embedding_invalidated || added > 0;
        info!(
            subsystem = "db",
            component = "terminology",
            op = "update",
            oid,
            entry_id = id,
            rebound = change.binding.is_some(),
            embedding_invalidated,
            "Terminology entry updated"
        );
        Ok(TerminologyUpdate {
            id,
            embedding_invalidated,
        })
    }

    async fn delete(&self, oid: OrgId, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        Self::lock_parent(&mut tx, oid, id).await?;

        let removed = sqlx::query("DELETE FROM terminology WHERE oid = $1 AND (id = $2 OR pid = $2)")
            .bind(oid)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "terminology",
            op = "delete",
            oid,
            entry_id = id,
            rows = removed,
            "Terminology entry deleted"
        );
        Ok(())
    }

    async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE terminology SET enabled = $1 WHERE oid = $2 AND ((id = $3 AND pid IS NULL) OR pid = $3)",
        )
        .bind(enabled)
        .bind(oid)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(EntityKind::Terminology, id));
        }

        info!(
            subsystem = "db",
            component = "terminology",
            op = "set_enabled",
            oid,
            entry_id = id,
            enabled,
            "Terminology enabled flag set"
        );
        Ok(())
    }

    async fn load_candidates(
        &self,
        oid: OrgId,
        ctx: &QueryContext,
    ) -> Result<Vec<TerminologyEntry>> {
        // JSONB containment over the GIN-indexed lists; the scope gate is
        // re-applied in process.
        let sql = format!(
            r#"
            SELECT {}
            FROM terminology
            WHERE oid = $1
              AND enabled = TRUE
              AND (
                    scope = 'global'
                 OR (scope = 'datasource' AND $2::bigint IS NOT NULL
                     AND datasource_ids @> jsonb_build_array($2::bigint))
                 OR (scope = 'table'
                     AND table_ids @> ANY(ARRAY(SELECT jsonb_build_array(x) FROM unnest($3::bigint[]) AS x)))
                 OR (scope = 'field'
                     AND field_ids @> ANY(ARRAY(SELECT jsonb_build_array(x) FROM unnest($4::bigint[]) AS x)))
              )
            ORDER BY id
            "#,
            TERMINOLOGY_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(oid)
            .bind(ctx.datasource_id)
            .bind(&ctx.table_ids)
            .bind(&ctx.field_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_entry(row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    subsystem = "db",
                    component = "terminology",
                    op = "load_candidates",
                    oid,
                    error = %e,
                    "Skipping unreadable terminology row"
                ),
            }
        }

        debug!(
            subsystem = "db",
            component = "terminology",
            op = "load_candidates",
            oid,
            candidate_count = entries.len(),
            "Loaded scope-eligible candidates"
        );
        Ok(entries)
    }

    async fn pending_embeddings(&self, oid: OrgId, id: i64) -> Result<Vec<EmbeddingTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT id, oid, word, description
            FROM terminology
            WHERE oid = $1 AND (id = $2 OR pid = $2) AND embedding IS NULL
            ORDER BY id
            "#,
        )
        .bind(oid)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(row_to_target).collect())
    }

    async fn list_pending_embeddings(&self, limit: i64) -> Result<Vec<EmbeddingTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT id, oid, word, description
            FROM terminology
            WHERE embedding IS NULL
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(row_to_target).collect())
    }

    async fn store_embedding(&self, target: &EmbeddingTarget, embedding: &Vector) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE terminology
            SET embedding = $1
            WHERE id = $2 AND oid = $3 AND word = $4
              AND description IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(embedding)
        .bind(target.id)
        .bind(target.oid)
        .bind(&target.word)
        .bind(&target.description)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
