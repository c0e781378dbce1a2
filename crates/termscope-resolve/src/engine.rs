//! Scoped semantic resolution.
//!
//! `resolve` embeds the query and loads the organization's enabled
//! terminology rows concurrently. It applies the scope gate, then ranks the
//! surviving rows by vector distance to the query. Synonym rows collapse
//! onto their parent entry with the best distance of the group. Ties go to
//! the lower entry id.
//!
//! When the embedding backend fails, the engine still answers: it returns the
//! scope-eligible entries newest first, with no distances (degraded mode).
//! Rows without an embedding are never ranked and never cause an error.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use termscope_core::{
    CatalogLookup, DimensionRepository, DimensionValueSet, Distance, EmbeddingBackend,
    EntityKind, Error, QueryContext, Result, TerminologyEntry, TerminologyRepository, Vector,
};

use crate::config::ResolverConfig;

/// How the result list was ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Ordered by distance to the query embedding.
    Ranked,
    /// Embedding unavailable: ordered by creation time, newest first.
    Degraded,
}

/// One resolved terminology entry.
#[derive(Debug, Clone)]
pub struct ResolvedTerm {
    /// The parent row of the entry group.
    pub entry: TerminologyEntry,
    /// The word (main word or synonym) closest to the query.
    pub matched_word: String,
    /// `None` in degraded mode.
    pub distance: Option<f32>,
}

/// Result of [`ResolutionEngine::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request_id: Uuid,
    pub mode: ResolutionMode,
    pub terms: Vec<ResolvedTerm>,
}

impl Resolution {
    pub fn is_degraded(&self) -> bool {
        self.mode == ResolutionMode::Degraded
    }

    pub fn entry_ids(&self) -> Vec<i64> {
        self.terms.iter().map(|t| t.entry.id).collect()
    }
}

/// Orchestrates the scope gate, embedding and ranking.
pub struct ResolutionEngine {
    terminology: Arc<dyn TerminologyRepository>,
    dimensions: Arc<dyn DimensionRepository>,
    catalog: Arc<dyn CatalogLookup>,
    embedder: Arc<dyn EmbeddingBackend>,
    distance: Arc<dyn Distance>,
    config: ResolverConfig,
}

impl ResolutionEngine {
    pub fn new(
        terminology: Arc<dyn TerminologyRepository>,
        dimensions: Arc<dyn DimensionRepository>,
        catalog: Arc<dyn CatalogLookup>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            distance: config.metric.build(),
            terminology,
            dimensions,
            catalog,
            embedder,
            config,
        }
    }

    /// Replace the metric chosen by the configuration.
    pub fn with_distance(mut self, distance: Arc<dyn Distance>) -> Self {
        self.distance = distance;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// [`resolve`](Self::resolve) with the configured default `top_k`.
    pub async fn resolve_default(&self, ctx: &QueryContext, query: &str) -> Result<Resolution> {
        self.resolve(ctx, query, self.config.default_top_k as i64)
            .await
    }

    /// Rank the terminology entries applicable to `ctx` against `query`.
    ///
    /// Fails only for a context without an organization, a non-positive
    /// `top_k`, or a storage error. `top_k` above the configured maximum is
    /// clamped.
    pub async fn resolve(&self, ctx: &QueryContext, query: &str, top_k: i64) -> Result<Resolution> {
        self.resolve_request(Uuid::now_v7(), ctx, query, top_k)
            .await
    }

    #[instrument(skip_all, fields(subsystem = "resolve", component = "resolution_engine", op = "resolve", request_id = %request_id, oid = ?ctx.oid, top_k = top_k))]
    async fn resolve_request(
        &self,
        request_id: Uuid,
        ctx: &QueryContext,
        query: &str,
        top_k: i64,
    ) -> Result<Resolution> {
        let start = Instant::now();
        let oid = ctx.require_oid()?;
        if top_k <= 0 {
            return Err(Error::out_of_range(
                EntityKind::Context,
                "top_k",
                format!("top_k must be positive, got {}", top_k),
            ));
        }
        let limit = (top_k as usize).min(self.config.max_top_k);

        let query = query.trim();
        let (embedding, candidates) = if query.is_empty() {
            (
                Err(Error::Embedding("empty query".to_string())),
                self.terminology.load_candidates(oid, ctx).await,
            )
        } else {
            tokio::join!(
                self.embedder.embed(query),
                self.terminology.load_candidates(oid, ctx)
            )
        };
        let candidates = candidates?;

        let mut malformed = 0usize;
        let eligible: Vec<&TerminologyEntry> = candidates
            .iter()
            .filter(|e| e.oid == oid && e.enabled)
            .filter(|e| {
                if e.binding().is_none() {
                    malformed += 1;
                    return false;
                }
                e.applies_to(ctx)
            })
            .collect();
        if malformed > 0 {
            warn!(
                malformed,
                "Skipping terminology rows whose scope has no associations"
            );
        }
        debug!(
            loaded = candidates.len(),
            candidate_count = eligible.len(),
            "Scope gate applied"
        );

        let (mode, terms) = match embedding {
            Ok(vector) => (ResolutionMode::Ranked, self.rank(&vector, &eligible, limit)),
            Err(e) => {
                warn!(
                    degraded = true,
                    error = %e,
                    "Embedding unavailable; returning scope-filtered entries"
                );
                (ResolutionMode::Degraded, degraded(&eligible, limit))
            }
        };

        info!(
            result_count = terms.len(),
            degraded = mode == ResolutionMode::Degraded,
            duration_ms = start.elapsed().as_millis() as u64,
            "Resolution complete"
        );
        Ok(Resolution {
            request_id,
            mode,
            terms,
        })
    }

    fn rank(&self, query: &Vector, eligible: &[&TerminologyEntry], limit: usize) -> Vec<ResolvedTerm> {
        let parents: HashMap<i64, &TerminologyEntry> = eligible
            .iter()
            .filter(|e| !e.is_synonym())
            .map(|e| (e.id, *e))
            .collect();

        // Best (distance, row) per entry group.
        let mut best: HashMap<i64, (f32, &TerminologyEntry)> = HashMap::new();
        let mut unscored = 0usize;
        for row in eligible {
            let Some(embedding) = row.embedding.as_ref() else {
                continue;
            };
            let Some(distance) = self.distance.distance(query.as_slice(), embedding.as_slice())
            else {
                unscored += 1;
                continue;
            };
            trace!(entry_id = row.id, word = %row.word, distance, "Scored candidate");
            if self.config.max_distance.is_some_and(|max| distance > max) {
                continue;
            }
            best.entry(row.root_id())
                .and_modify(|current| {
                    if (distance, row.id) < (current.0, current.1.id) {
                        *current = (distance, *row);
                    }
                })
                .or_insert((distance, *row));
        }
        if unscored > 0 {
            debug!(
                unscored,
                metric = self.distance.name(),
                "Embeddings not comparable with the query"
            );
        }

        let mut ranked: Vec<ResolvedTerm> = best
            .into_iter()
            .filter_map(|(root, (distance, row))| {
                parents.get(&root).map(|parent| ResolvedTerm {
                    entry: (*parent).clone(),
                    matched_word: row.word.clone(),
                    distance: Some(distance),
                })
            })
            .collect();
        ranked.sort_by(|a, b| by_distance_then_id(a, b));
        ranked.truncate(limit);
        ranked
    }

    /// Enabled dimension value sets whose codes the candidate fields
    /// reference in catalog metadata. No ranking.
    #[instrument(skip_all, fields(subsystem = "resolve", component = "resolution_engine", op = "resolve_dimensions", oid = ?ctx.oid, field_count = ctx.field_ids.len()))]
    pub async fn resolve_dimensions(&self, ctx: &QueryContext) -> Result<Vec<DimensionValueSet>> {
        let oid = ctx.require_oid()?;
        if ctx.field_ids.is_empty() {
            return Ok(Vec::new());
        }
        let codes = self
            .catalog
            .dimension_codes_for_fields(oid, &ctx.field_ids)
            .await?;
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let dimensions = self.dimensions.find_by_codes(oid, &codes).await?;

        let found: BTreeSet<&str> = dimensions.iter().map(|d| d.code.as_str()).collect();
        let unresolved: Vec<&str> = codes
            .iter()
            .map(String::as_str)
            .filter(|c| !found.contains(c))
            .collect();
        if !unresolved.is_empty() {
            debug!(codes = ?unresolved, "Field dimension codes without an enabled dimension");
        }
        debug!(result_count = dimensions.len(), "Dimensions resolved");
        Ok(dimensions)
    }
}

fn by_distance_then_id(a: &ResolvedTerm, b: &ResolvedTerm) -> Ordering {
    let da = a.distance.unwrap_or(f32::INFINITY);
    let db = b.distance.unwrap_or(f32::INFINITY);
    da.total_cmp(&db).then(a.entry.id.cmp(&b.entry.id))
}

/// Parents newest first, ties by lower id.
fn degraded(eligible: &[&TerminologyEntry], limit: usize) -> Vec<ResolvedTerm> {
    let mut parents: Vec<&TerminologyEntry> =
        eligible.iter().copied().filter(|e| !e.is_synonym()).collect();
    parents.sort_by(|a, b| b.create_time.cmp(&a.create_time).then(a.id.cmp(&b.id)));
    parents
        .into_iter()
        .take(limit)
        .map(|entry| ResolvedTerm {
            entry: entry.clone(),
            matched_word: entry.word.clone(),
            distance: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use termscope_core::TermScope;

    fn entry(id: i64, pid: Option<i64>, age_secs: i64) -> TerminologyEntry {
        TerminologyEntry {
            id,
            oid: 1,
            pid,
            word: format!("w{}", id),
            description: None,
            embedding: None,
            scope: TermScope::Global,
            datasource_ids: None,
            table_ids: None,
            field_ids: None,
            enabled: true,
            create_time: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn term(id: i64, distance: Option<f32>) -> ResolvedTerm {
        ResolvedTerm {
            entry: entry(id, None, 0),
            matched_word: String::new(),
            distance,
        }
    }

    #[test]
    fn test_distance_then_id_ordering() {
        let mut terms = vec![
            term(5, Some(0.2)),
            term(3, Some(0.1)),
            term(2, Some(0.2)),
            term(1, Some(0.9)),
        ];
        terms.sort_by(by_distance_then_id);
        let ids: Vec<i64> = terms.iter().map(|t| t.entry.id).collect();
        assert_eq!(ids, vec![3, 2, 5, 1]);
    }

    #[test]
    fn test_degraded_orders_newest_first_and_skips_synonyms() {
        let mut rows = vec![
            entry(1, None, 30),
            entry(2, None, 10),
            entry(3, Some(1), 0),
            entry(4, None, 10),
        ];
        rows[3].create_time = rows[1].create_time;
        let refs: Vec<&TerminologyEntry> = rows.iter().collect();

        let terms = degraded(&refs, 10);
        let ids: Vec<i64> = terms.iter().map(|t| t.entry.id).collect();
        assert_eq!(ids, vec![2, 4, 1]);
        assert!(terms.iter().all(|t| t.distance.is_none()));
        assert_eq!(terms[0].matched_word, "w2");
        assert_eq!(degraded(&refs, 1).len(), 1);
    }
}
