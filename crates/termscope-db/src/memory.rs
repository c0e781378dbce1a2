//! In-process stores implementing the repository and catalog traits.
//!
//! Each mutation takes the store lock once and validates against the locked
//! state, so checks and writes are atomic just as they are inside a Postgres
//! transaction. Used to embed the engine without a database and in tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use tokio::sync::Mutex;

use termscope_core::{
    apply_dimension_update, plan_terminology_update, CatalogLookup, DimensionFilter,
    DimensionRepository, DimensionSummary, DimensionValueSet, EmbeddingTarget, EntityKind,
    Error, ForbiddenReason, NewDimension, NewTerminology, OrgId, Page, PageRequest,
    QueryContext, Result, TerminologyEntry, TerminologyFilter, TerminologyInfo,
    TerminologyRepository, TerminologyUpdate, UpdateDimensionRequest, UpdateTerminologyRequest,
    UserId,
};

fn paginate<T: Clone>(sorted: &[T], page: PageRequest) -> Page<T> {
    let total = sorted.len() as i64;
    let window = page.window(total);
    let items = sorted
        .iter()
        .skip(window.offset() as usize)
        .take(window.page_size as usize)
        .cloned()
        .collect();
    Page::new(items, window, total)
}

// =============================================================================
// DIMENSIONS
// =============================================================================

#[derive(Default)]
struct DimensionState {
    rows: BTreeMap<i64, DimensionValueSet>,
    next_id: i64,
}

impl DimensionState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn code_taken(&self, oid: OrgId, code: &str, exclude_id: Option<i64>) -> bool {
        self.rows
            .values()
            .any(|d| d.oid == oid && d.code == code && Some(d.id) != exclude_id)
    }

    fn get_mut(&mut self, oid: OrgId, id: i64) -> Result<&mut DimensionValueSet> {
        self.rows
            .get_mut(&id)
            .filter(|d| d.oid == oid)
            .ok_or_else(|| Error::not_found(EntityKind::Dimension, id))
    }
}

/// In-process DimensionRepository.
#[derive(Default)]
pub struct MemoryDimensionRepository {
    state: Mutex<DimensionState>,
}

impl MemoryDimensionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row as given (including `is_system` and timestamps). Ids
    /// allocated later continue above the largest stored id.
    pub async fn insert_raw(&self, dimension: DimensionValueSet) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(dimension.id);
        state.rows.insert(dimension.id, dimension);
    }
}

#[async_trait]
impl DimensionRepository for MemoryDimensionRepository {
    async fn list(
        &self,
        oid: OrgId,
        filter: &DimensionFilter,
        page: PageRequest,
    ) -> Result<Page<DimensionValueSet>> {
        let state = self.state.lock().await;
        let mut matching: Vec<DimensionValueSet> = state
            .rows
            .values()
            .filter(|d| d.oid == oid && filter.matches(d))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.create_time.cmp(&a.create_time).then(b.id.cmp(&a.id)));
        Ok(paginate(&matching, page))
    }

    async fn get(&self, oid: OrgId, id: i64) -> Result<Option<DimensionValueSet>> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&id).filter(|d| d.oid == oid).cloned())
    }

    async fn list_all(&self, oid: OrgId, enabled_only: bool) -> Result<Vec<DimensionSummary>> {
        let state = self.state.lock().await;
        let mut rows: Vec<&DimensionValueSet> = state
            .rows
            .values()
            .filter(|d| d.oid == oid && (!enabled_only || d.enabled))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().map(DimensionValueSet::to_summary).collect())
    }

    async fn find_by_codes(&self, oid: OrgId, codes: &[String]) -> Result<Vec<DimensionValueSet>> {
        let state = self.state.lock().await;
        let mut rows: Vec<DimensionValueSet> = state
            .rows
            .values()
            .filter(|d| d.oid == oid && d.enabled && codes.contains(&d.code))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create(&self, oid: OrgId, new: &NewDimension, actor: UserId) -> Result<i64> {
        let mut state = self.state.lock().await;
        if state.code_taken(oid, &new.code, None) {
            return Err(Error::duplicate(EntityKind::Dimension, "code", &new.code));
        }
        let id = state.allocate_id();
        state.rows.insert(
            id,
            DimensionValueSet {
                id,
                oid,
                name: new.name.clone(),
                code: new.code.clone(),
                description: new.description.clone(),
                values: new.values.clone(),
                value_labels: new.value_labels.clone(),
                is_system: false,
                enabled: new.enabled,
                create_time: Utc::now(),
                update_time: None,
                create_by: Some(actor),
                update_by: None,
            },
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
        let mut state = self.state.lock().await;
        let existing = state.get_mut(oid, id)?.clone();
        let change = apply_dimension_update(&existing, req, actor, Utc::now())?;
        if change.code_changed && state.code_taken(oid, &change.updated.code, Some(id)) {
            return Err(Error::duplicate(
                EntityKind::Dimension,
                "code",
                &change.updated.code,
            ));
        }
        *state.get_mut(oid, id)? = change.updated.clone();
        Ok(change.updated)
    }

    async fn delete(&self, oid: OrgId, id: i64) -> Result<DimensionValueSet> {
        let mut state = self.state.lock().await;
        if state.get_mut(oid, id)?.is_system {
            return Err(Error::Forbidden {
                entity: EntityKind::Dimension,
                id,
                reason: ForbiddenReason::SystemEntryDelete,
            });
        }
        state
            .rows
            .remove(&id)
            .ok_or_else(|| Error::not_found(EntityKind::Dimension, id))
    }

    async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool, actor: UserId) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state.get_mut(oid, id)?;
        row.enabled = enabled;
        row.update_time = Some(Utc::now());
        row.update_by = Some(actor);
        Ok(())
    }

    async fn seed_system(&self, oid: OrgId, seeds: &[NewDimension]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for seed in seeds {
            if state.code_taken(oid, &seed.code, None) {
                continue;
            }
            let id = state.allocate_id();
            state.rows.insert(
                id,
                DimensionValueSet {
                    id,
                    oid,
                    name: seed.name.clone(),
                    code: seed.code.clone(),
                    description: seed.description.clone(),
                    values: seed.values.clone(),
                    value_labels: seed.value_labels.clone(),
                    is_system: true,
                    enabled: seed.enabled,
                    create_time: Utc::now(),
                    update_time: None,
                    create_by: None,
                    update_by: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }
}

// =============================================================================
// TERMINOLOGY
// =============================================================================

#[derive(Default)]
struct TerminologyState {
    rows: BTreeMap<i64, TerminologyEntry>,
    next_id: i64,
}

impl TerminologyState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn parent(&self, oid: OrgId, id: i64) -> Result<&TerminologyEntry> {
        self.rows
            .get(&id)
            .filter(|e| e.oid == oid && e.pid.is_none())
            .ok_or_else(|| Error::not_found(EntityKind::Terminology, id))
    }

    fn children(&self, id: i64) -> Vec<TerminologyEntry> {
        self.rows
            .values()
            .filter(|e| e.pid == Some(id))
            .cloned()
            .collect()
    }

    fn info(&self, parent: &TerminologyEntry) -> TerminologyInfo {
        TerminologyInfo::from_group(parent, &self.children(parent.id))
    }

    fn insert_synonyms(&mut self, parent: &TerminologyEntry, words: &[String]) {
        for word in words {
            let id = self.allocate_id();
            self.rows.insert(
                id,
                TerminologyEntry {
                    id,
                    pid: Some(parent.id),
                    word: word.clone(),
                    embedding: None,
                    ..parent.clone()
                },
            );
        }
    }
}

/// In-process TerminologyRepository.
#[derive(Default)]
pub struct MemoryTerminologyRepository {
    state: Mutex<TerminologyState>,
}

impl MemoryTerminologyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row as given (id, embedding, timestamps, possibly malformed
    /// scope). Ids allocated later continue above the largest stored id.
    pub async fn insert_raw(&self, entry: TerminologyEntry) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(entry.id);
        state.rows.insert(entry.id, entry);
    }

    /// Raw row by id, parent or synonym.
    pub async fn row(&self, id: i64) -> Option<TerminologyEntry> {
        self.state.lock().await.rows.get(&id).cloned()
    }
}

#[async_trait]
impl TerminologyRepository for MemoryTerminologyRepository {
    async fn list(
        &self,
        oid: OrgId,
        filter: &TerminologyFilter,
        page: PageRequest,
    ) -> Result<Page<TerminologyInfo>> {
        let state = self.state.lock().await;
        let mut parents: Vec<&TerminologyEntry> = state
            .rows
            .values()
            .filter(|e| e.oid == oid && e.pid.is_none())
            .collect();
        parents.sort_by(|a, b| b.create_time.cmp(&a.create_time).then(b.id.cmp(&a.id)));
        let matching: Vec<TerminologyInfo> = parents
            .into_iter()
            .map(|p| state.info(p))
            .filter(|info| filter.matches(info))
            .collect();
        Ok(paginate(&matching, page))
    }

    async fn get(&self, oid: OrgId, id: i64) -> Result<Option<TerminologyInfo>> {
        let state = self.state.lock().await;
        Ok(state.parent(oid, id).ok().map(|p| state.info(p)))
    }

    async fn create(&self, oid: OrgId, new: &NewTerminology) -> Result<i64> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let binding = &new.binding;
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
            create_time: Utc::now(),
        };
        state.rows.insert(id, parent.clone());
        state.insert_synonyms(&parent, &new.other_words);
        Ok(id)
    }

    async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateTerminologyRequest,
    ) -> Result<TerminologyUpdate> {
        let mut state = self.state.lock().await;
        let existing = state.parent(oid, id)?.clone();
        let change = plan_terminology_update(&existing, req)?;
        let description_changed = change.description != existing.description;

        let mut updated = TerminologyEntry {
            word: change.word.clone(),
            description: change.description.clone(),
            enabled: change.enabled,
            ..existing.clone()
        };
        if let Some(binding) = &change.binding {
            updated.scope = binding.scope();
            updated.datasource_ids = Some(binding.datasource_ids());
            updated.table_ids = Some(binding.table_ids());
            updated.field_ids = Some(binding.field_ids());
        }
        if change.embedding_invalidated {
            updated.embedding = None;
        }
        state.rows.insert(id, updated.clone());

        for child in state.rows.values_mut().filter(|e| e.pid == Some(id)) {
            child.description = updated.description.clone();
            child.scope = updated.scope;
            child.datasource_ids = updated.datasource_ids.clone();
            child.table_ids = updated.table_ids.clone();
            child.field_ids = updated.field_ids.clone();
            child.enabled = updated.enabled;
            if description_changed {
                child.embedding = None;
            }
        }

        if let Some(word) = &change.retired_synonym {
            state
                .rows
                .retain(|_, e| e.pid != Some(id) || &e.word != word);
        }

        let mut added = 0;
        if let Some(words) = &change.other_words {
            state
                .rows
                .retain(|_, e| e.pid != Some(id) || words.contains(&e.word));
            let kept: BTreeSet<String> = state.children(id).into_iter().map(|c| c.word).collect();
            let missing: Vec<String> = words
                .iter()
                .filter(|w| !kept.contains(*w))
                .cloned()
                .collect();
            added = missing.len();
            state.insert_synonyms(&updated, &missing);
        }

        Ok(TerminologyUpdate {
            id,
            embedding_invalidated: change.embedding_invalidated || added > 0,
        })
    }

    async fn delete(&self, oid: OrgId, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.parent(oid, id)?;
        state.rows.retain(|_, e| e.id != id && e.pid != Some(id));
        Ok(())
    }

    async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.parent(oid, id)?;
        for row in state
            .rows
            .values_mut()
            .filter(|e| e.id == id || e.pid == Some(id))
        {
            row.enabled = enabled;
        }
        Ok(())
    }

    async fn load_candidates(
        &self,
        oid: OrgId,
        ctx: &QueryContext,
    ) -> Result<Vec<TerminologyEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|e| e.oid == oid && e.enabled)
            .filter(|e| e.applies_to(ctx))
            .cloned()
            .collect())
    }

    async fn pending_embeddings(&self, oid: OrgId, id: i64) -> Result<Vec<EmbeddingTarget>> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|e| e.oid == oid && (e.id == id || e.pid == Some(id)) && e.embedding.is_none())
            .map(to_target)
            .collect())
    }

    async fn list_pending_embeddings(&self, limit: i64) -> Result<Vec<EmbeddingTarget>> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|e| e.embedding.is_none())
            .take(limit.max(1) as usize)
            .map(to_target)
            .collect())
    }

    async fn store_embedding(&self, target: &EmbeddingTarget, embedding: &Vector) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(&target.id) {
            Some(row)
                if row.oid == target.oid
                    && row.word == target.word
                    && row.description == target.description =>
            {
                row.embedding = Some(embedding.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn to_target(entry: &TerminologyEntry) -> EmbeddingTarget {
    EmbeddingTarget {
        id: entry.id,
        oid: entry.oid,
        word: entry.word.clone(),
        description: entry.description.clone(),
    }
}

// =============================================================================
// CATALOG
// =============================================================================

#[derive(Debug, Clone)]
struct CatalogField {
    oid: OrgId,
    table_id: i64,
    dimension_code: Option<String>,
}

/// In-process catalog with datasources, tables, and fields registered up
/// front.
#[derive(Default)]
pub struct StaticCatalog {
    datasources: BTreeMap<i64, OrgId>,
    tables: BTreeMap<i64, (OrgId, i64)>,
    fields: BTreeMap<i64, CatalogField>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasource(mut self, oid: OrgId, id: i64) -> Self {
        self.datasources.insert(id, oid);
        self
    }

    pub fn with_table(mut self, oid: OrgId, datasource_id: i64, id: i64) -> Self {
        self.tables.insert(id, (oid, datasource_id));
        self
    }

    pub fn with_field(
        mut self,
        oid: OrgId,
        table_id: i64,
        id: i64,
        dimension_code: Option<&str>,
    ) -> Self {
        self.fields.insert(
            id,
            CatalogField {
                oid,
                table_id,
                dimension_code: dimension_code.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl CatalogLookup for StaticCatalog {
    async fn dimension_codes_for_fields(
        &self,
        oid: OrgId,
        field_ids: &[i64],
    ) -> Result<Vec<String>> {
        let codes: BTreeSet<String> = field_ids
            .iter()
            .filter_map(|id| self.fields.get(id))
            .filter(|f| f.oid == oid)
            .filter_map(|f| f.dimension_code.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Ok(codes.into_iter().collect())
    }

    async fn count_fields_using_dimension(&self, oid: OrgId, code: &str) -> Result<i64> {
        let code = code.trim();
        Ok(self
            .fields
            .values()
            .filter(|f| f.oid == oid && f.dimension_code.as_deref().map(str::trim) == Some(code))
            .count() as i64)
    }

    async fn existing_datasource_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>> {
        Ok(existing(ids, |id| self.datasources.get(&id) == Some(&oid)))
    }

    async fn existing_table_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>> {
        Ok(existing(ids, |id| {
            self.tables.get(&id).is_some_and(|(o, _)| *o == oid)
        }))
    }

    async fn existing_field_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>> {
        Ok(existing(ids, |id| {
            self.fields
                .get(&id)
                .is_some_and(|f| f.oid == oid && self.tables.contains_key(&f.table_id))
        }))
    }
}

fn existing(ids: &[i64], exists: impl Fn(i64) -> bool) -> Vec<i64> {
    let set: BTreeSet<i64> = ids.iter().copied().filter(|id| exists(*id)).collect();
    set.into_iter().collect()
}
