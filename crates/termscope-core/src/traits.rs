//! Collaborator traits for termscope.
//!
//! Repositories own persistence and re-validate state-dependent invariants
//! atomically with each write. The catalog and embedding collaborators are
//! external subsystems consumed read-only and best-effort respectively.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;
use crate::scope::QueryContext;

// =============================================================================
// DIMENSION REPOSITORY
// =============================================================================

/// Storage for dimension value sets.
///
/// Code uniqueness, system-code immutability, and system-entry protection are
/// checked inside the same transaction (or lock) that performs the write.
#[async_trait]
pub trait DimensionRepository: Send + Sync {
    /// Page of entries ordered by creation time descending.
    async fn list(
        &self,
        oid: OrgId,
        filter: &DimensionFilter,
        page: PageRequest,
    ) -> Result<Page<DimensionValueSet>>;

    async fn get(&self, oid: OrgId, id: i64) -> Result<Option<DimensionValueSet>>;

    /// Unpaginated summaries ordered by name ascending.
    async fn list_all(&self, oid: OrgId, enabled_only: bool) -> Result<Vec<DimensionSummary>>;

    /// Enabled entries whose code is one of `codes`, ordered by name.
    async fn find_by_codes(&self, oid: OrgId, codes: &[String]) -> Result<Vec<DimensionValueSet>>;

    /// Insert a user entry (`is_system = false`). Returns the new id.
    async fn create(&self, oid: OrgId, new: &NewDimension, actor: UserId) -> Result<i64>;

    async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateDimensionRequest,
        actor: UserId,
    ) -> Result<DimensionValueSet>;

    /// Hard-delete a user entry, returning the removed row.
    async fn delete(&self, oid: OrgId, id: i64) -> Result<DimensionValueSet>;

    async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool, actor: UserId) -> Result<()>;

    /// Insert system entries whose code is not yet present. Returns how many
    /// were inserted.
    async fn seed_system(&self, oid: OrgId, seeds: &[NewDimension]) -> Result<usize>;
}

/// Pre-delete check for dimensions. Implementations return
/// `Error::Conflict` with `ConflictReason::InUse` to block.
#[async_trait]
pub trait DimensionUsageGuard: Send + Sync {
    async fn check_delete(&self, dimension: &DimensionValueSet) -> Result<()>;
}

// =============================================================================
// TERMINOLOGY REPOSITORY
// =============================================================================

/// Outcome of a terminology update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminologyUpdate {
    pub id: i64,
    /// Embeddings of the group were cleared.
    pub embedding_invalidated: bool,
}

/// Storage for terminology entries and their synonym rows.
#[async_trait]
pub trait TerminologyRepository: Send + Sync {
    /// Page of parent entries ordered by creation time descending.
    async fn list(
        &self,
        oid: OrgId,
        filter: &TerminologyFilter,
        page: PageRequest,
    ) -> Result<Page<TerminologyInfo>>;

    /// A parent entry with its synonyms folded in. Synonym ids return `None`.
    async fn get(&self, oid: OrgId, id: i64) -> Result<Option<TerminologyInfo>>;

    /// Insert the parent row and one child row per synonym. Returns the
    /// parent id.
    async fn create(&self, oid: OrgId, new: &NewTerminology) -> Result<i64>;

    /// Apply a partial update to the parent and propagate shared attributes
    /// to its synonym rows.
    async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateTerminologyRequest,
    ) -> Result<TerminologyUpdate>;

    /// Delete the parent and its synonym rows.
    async fn delete(&self, oid: OrgId, id: i64) -> Result<()>;

    async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool) -> Result<()>;

    /// Enabled rows (parents and synonyms) that may apply to `ctx`.
    ///
    /// Storage may pre-filter by scope; callers re-apply the scope gate.
    /// Rows without an embedding are included.
    async fn load_candidates(&self, oid: OrgId, ctx: &QueryContext)
        -> Result<Vec<TerminologyEntry>>;

    /// Rows of one group still missing an embedding.
    async fn pending_embeddings(&self, oid: OrgId, id: i64) -> Result<Vec<EmbeddingTarget>>;

    /// Rows missing an embedding across all organizations, oldest first.
    async fn list_pending_embeddings(&self, limit: i64) -> Result<Vec<EmbeddingTarget>>;

    /// Store an embedding if the row still has the text it was computed
    /// from. Returns false when the row changed or vanished meanwhile.
    async fn store_embedding(&self, target: &EmbeddingTarget, embedding: &Vector) -> Result<bool>;
}

// =============================================================================
// CATALOG COLLABORATOR
// =============================================================================

/// Read-only view of the schema catalog (datasources, tables, fields).
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// Distinct dimension codes referenced by the given fields.
    async fn dimension_codes_for_fields(&self, oid: OrgId, field_ids: &[i64])
        -> Result<Vec<String>>;

    /// Number of fields whose metadata references `code`.
    async fn count_fields_using_dimension(&self, oid: OrgId, code: &str) -> Result<i64>;

    /// Subset of `ids` that exist.
    async fn existing_datasource_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>>;

    async fn existing_table_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>>;

    async fn existing_field_ids(&self, oid: OrgId, ids: &[i64]) -> Result<Vec<i64>>;
}

// =============================================================================
// EMBEDDING COLLABORATOR
// =============================================================================

/// Backend for generating text embeddings. May be slow or unavailable.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts, one vector per input.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| crate::Error::Embedding("backend returned no embedding".to_string()))
    }
}
