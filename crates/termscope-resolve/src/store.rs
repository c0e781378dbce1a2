//! Terminology store: CRUD, synonyms and embedding lifecycle.
//!
//! Writes that change a word or description clear the affected embeddings in
//! the repository. With [`EmbeddingPolicy::Inline`] the store then embeds the
//! pending rows right away; a failure there is logged and the rows stay
//! pending for the backfill worker. They remain usable for scope-only
//! matching in the meantime.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use termscope_core::{
    CatalogLookup, CreateTerminologyRequest, EmbeddingBackend, EntityKind, Error, OrgId, Page,
    PageRequest, Result, TerminologyFilter, TerminologyInfo, TerminologyRepository,
    UpdateTerminologyRequest,
};

use crate::config::EmbeddingPolicy;

/// Association ids of an entry that no longer exist in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleAssociations {
    pub datasource_ids: Vec<i64>,
    pub table_ids: Vec<i64>,
    pub field_ids: Vec<i64>,
}

impl StaleAssociations {
    pub fn is_empty(&self) -> bool {
        self.datasource_ids.is_empty() && self.table_ids.is_empty() && self.field_ids.is_empty()
    }
}

/// Service over a [`TerminologyRepository`].
pub struct TerminologyStore {
    repo: Arc<dyn TerminologyRepository>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    policy: EmbeddingPolicy,
    catalog: Option<Arc<dyn CatalogLookup>>,
}

impl TerminologyStore {
    /// A store without an embedder: every row stays pending until the
    /// backfill worker picks it up.
    pub fn new(repo: Arc<dyn TerminologyRepository>) -> Self {
        Self {
            repo,
            embedder: None,
            policy: EmbeddingPolicy::Deferred,
            catalog: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingBackend>, policy: EmbeddingPolicy) -> Self {
        self.embedder = Some(embedder);
        self.policy = policy;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogLookup>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub async fn list(
        &self,
        oid: OrgId,
        filter: &TerminologyFilter,
        page: PageRequest,
    ) -> Result<Page<TerminologyInfo>> {
        self.repo.list(oid, filter, page).await
    }

    pub async fn get(&self, oid: OrgId, id: i64) -> Result<TerminologyInfo> {
        self.repo
            .get(oid, id)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Terminology, id))
    }

    #[instrument(skip(self, req), fields(subsystem = "resolve", component = "terminology_store", op = "create", synonym_count = req.other_words.len()))]
    pub async fn create(&self, oid: OrgId, req: &CreateTerminologyRequest) -> Result<i64> {
        let new = req.validate()?;
        let id = self.repo.create(oid, &new).await?;
        info!(entry_id = id, scope = %new.binding.scope(), "Terminology created");
        self.embed_after_write(oid, id).await;
        Ok(id)
    }

    #[instrument(skip(self, req), fields(subsystem = "resolve", component = "terminology_store", op = "update"))]
    pub async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateTerminologyRequest,
    ) -> Result<TerminologyInfo> {
        let outcome = self.repo.update(oid, id, req).await?;
        info!(
            embedding_invalidated = outcome.embedding_invalidated,
            "Terminology updated"
        );
        if outcome.embedding_invalidated {
            self.embed_after_write(oid, id).await;
        }
        self.get(oid, id).await
    }

    #[instrument(skip(self), fields(subsystem = "resolve", component = "terminology_store", op = "delete"))]
    pub async fn delete(&self, oid: OrgId, id: i64) -> Result<()> {
        self.repo.delete(oid, id).await?;
        info!("Terminology deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(subsystem = "resolve", component = "terminology_store", op = "set_enabled"))]
    pub async fn set_enabled(&self, oid: OrgId, id: i64, enabled: bool) -> Result<()> {
        self.repo.set_enabled(oid, id, enabled).await
    }

    /// Embed every row of the group that is missing an embedding. Returns
    /// how many were stored.
    ///
    /// Rows edited while the embedding was computed are skipped; they stay
    /// pending for the next attempt.
    pub async fn refresh_embeddings(&self, oid: OrgId, id: i64) -> Result<usize> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::Config("no embedding backend configured".to_string()))?;

        let pending = self.repo.pending_embeddings(oid, id).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = pending.iter().map(|t| t.text()).collect();
        let vectors = embedder.embed_texts(&texts).await?;
        if vectors.len() != pending.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                pending.len(),
                vectors.len()
            )));
        }

        let mut stored = 0;
        for (target, vector) in pending.iter().zip(&vectors) {
            if self.repo.store_embedding(target, vector).await? {
                stored += 1;
            } else {
                debug!(entry_id = target.id, "Row changed during embedding; left pending");
            }
        }
        Ok(stored)
    }

    async fn embed_after_write(&self, oid: OrgId, id: i64) {
        if self.embedder.is_none() || self.policy == EmbeddingPolicy::Deferred {
            return;
        }
        match self.refresh_embeddings(oid, id).await {
            Ok(stored) => debug!(entry_id = id, stored, "Embeddings computed on write"),
            Err(e) => warn!(
                entry_id = id,
                error = %e,
                "Embedding on write failed; entry left for backfill"
            ),
        }
    }

    /// Referenced datasource/table/field ids that the catalog no longer
    /// knows. Administrative only; resolution never consults the catalog.
    #[instrument(skip(self), fields(subsystem = "resolve", component = "terminology_store", op = "stale_associations"))]
    pub async fn stale_associations(&self, oid: OrgId, id: i64) -> Result<StaleAssociations> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| Error::Config("no catalog configured".to_string()))?;
        let info = self.get(oid, id).await?;

        let datasource_ids = info.datasource_ids.unwrap_or_default();
        let table_ids = info.table_ids.unwrap_or_default();
        let field_ids = info.field_ids.unwrap_or_default();

        let stale = StaleAssociations {
            datasource_ids: missing(
                &datasource_ids,
                catalog.existing_datasource_ids(oid, &datasource_ids).await?,
            ),
            table_ids: missing(&table_ids, catalog.existing_table_ids(oid, &table_ids).await?),
            field_ids: missing(&field_ids, catalog.existing_field_ids(oid, &field_ids).await?),
        };
        if !stale.is_empty() {
            warn!(stale = ?stale, "Terminology references missing catalog objects");
        }
        Ok(stale)
    }
}

fn missing(referenced: &[i64], existing: Vec<i64>) -> Vec<i64> {
    let existing: BTreeSet<i64> = existing.into_iter().collect();
    let referenced: BTreeSet<i64> = referenced.iter().copied().collect();
    referenced.difference(&existing).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use termscope_core::{TermScope, ValidationRule};
    use termscope_db::{MemoryTerminologyRepository, StaticCatalog};
    use termscope_inference::mock::MockEmbedder;

    fn gmv() -> CreateTerminologyRequest {
        CreateTerminologyRequest {
            word: "GMV".to_string(),
            description: Some("Gross merchandise value".to_string()),
            other_words: vec!["turnover".to_string()],
            ..Default::default()
        }
    }

    fn store(
        embedder: &MockEmbedder,
        policy: EmbeddingPolicy,
    ) -> (TerminologyStore, Arc<MemoryTerminologyRepository>) {
        let repo = Arc::new(MemoryTerminologyRepository::new());
        let store =
            TerminologyStore::new(repo.clone()).with_embedder(Arc::new(embedder.clone()), policy);
        (store, repo)
    }

    #[tokio::test]
    async fn test_create_embeds_inline() {
        let embedder = MockEmbedder::new(4);
        let (store, _) = store(&embedder, EmbeddingPolicy::Inline);
        let id = store.create(1, &gmv()).await.unwrap();

        let info = store.get(1, id).await.unwrap();
        assert!(info.embedded);
        assert_eq!(info.other_words, vec!["turnover"]);
        assert_eq!(embedder.call_count(), 1);
        let mut texts = embedder.embedded_texts();
        texts.sort();
        assert_eq!(
            texts,
            vec!["GMV: Gross merchandise value", "turnover: Gross merchandise value"]
        );
    }

    #[tokio::test]
    async fn test_deferred_policy_leaves_rows_pending() {
        let embedder = MockEmbedder::new(4);
        let (store, repo) = store(&embedder, EmbeddingPolicy::Deferred);
        let id = store.create(1, &gmv()).await.unwrap();

        assert!(!store.get(1, id).await.unwrap().embedded);
        assert_eq!(embedder.call_count(), 0);
        assert_eq!(repo.pending_embeddings(1, id).await.unwrap().len(), 2);

        assert_eq!(store.refresh_embeddings(1, id).await.unwrap(), 2);
        assert!(store.get(1, id).await.unwrap().embedded);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_not_an_error() {
        let embedder = MockEmbedder::new(4).failing();
        let (store, _) = store(&embedder, EmbeddingPolicy::Inline);
        let id = store.create(1, &gmv()).await.unwrap();
        assert!(!store.get(1, id).await.unwrap().embedded);

        embedder.set_failing(false);
        assert_eq!(store.refresh_embeddings(1, id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_reembeds_changed_text_only() {
        let embedder = MockEmbedder::new(4);
        let (store, repo) = store(&embedder, EmbeddingPolicy::Inline);
        let id = store.create(1, &gmv()).await.unwrap();
        let before = repo.row(id).await.unwrap().embedding;
        embedder.clear_calls();

        store
            .update(
                1,
                id,
                &UpdateTerminologyRequest {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(embedder.call_count(), 0);

        let info = store
            .update(
                1,
                id,
                &UpdateTerminologyRequest {
                    word: Some("Gross Merchandise Value".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(info.word, "Gross Merchandise Value");
        assert!(info.embedded);
        assert_eq!(
            embedder.embedded_texts(),
            vec!["Gross Merchandise Value: Gross merchandise value"]
        );
        assert_ne!(repo.row(id).await.unwrap().embedding, before);
    }

    #[tokio::test]
    async fn test_scope_change_clears_other_lists() {
        let embedder = MockEmbedder::new(4);
        let (store, _) = store(&embedder, EmbeddingPolicy::Deferred);
        let id = store
            .create(
                1,
                &CreateTerminologyRequest {
                    word: "status".to_string(),
                    scope: TermScope::Table,
                    table_ids: Some(vec![42]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let info = store
            .update(
                1,
                id,
                &UpdateTerminologyRequest {
                    scope: Some(TermScope::Field),
                    field_ids: Some(vec![7, 8]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(info.scope, TermScope::Field);
        assert_eq!(info.field_ids, Some(vec![7, 8]));
        assert_eq!(info.table_ids, Some(vec![]));

        let err = store
            .update(
                1,
                id,
                &UpdateTerminologyRequest {
                    scope: Some(TermScope::Datasource),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                field: "datasource_ids",
                rule: ValidationRule::Required,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_word_validation() {
        let embedder = MockEmbedder::new(4);
        let (store, _) = store(&embedder, EmbeddingPolicy::Inline);
        let blank = CreateTerminologyRequest {
            word: "  ".to_string(),
            ..Default::default()
        };
        assert_eq!(
            store.create(1, &blank).await.unwrap_err().message_key(),
            "i18n_terminology.word_required"
        );
        let long = CreateTerminologyRequest {
            word: "x".repeat(256),
            ..Default::default()
        };
        assert_eq!(
            store.create(1, &long).await.unwrap_err().message_key(),
            "i18n_terminology.word_too_long"
        );
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_missing_entries() {
        let embedder = MockEmbedder::new(4);
        let (store, repo) = store(&embedder, EmbeddingPolicy::Inline);
        let id = store.create(1, &gmv()).await.unwrap();
        store.delete(1, id).await.unwrap();

        assert!(matches!(
            store.get(1, id).await.unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(repo.pending_embeddings(1, id).await.unwrap().is_empty());
        assert!(matches!(
            store.set_enabled(1, id, true).await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_associations() {
        let repo = Arc::new(MemoryTerminologyRepository::new());
        let catalog = StaticCatalog::new()
            .with_datasource(1, 3)
            .with_table(1, 3, 42)
            .with_field(1, 42, 100, None);
        let store = TerminologyStore::new(repo).with_catalog(Arc::new(catalog));

        let id = store
            .create(
                1,
                &CreateTerminologyRequest {
                    word: "status".to_string(),
                    scope: TermScope::Table,
                    table_ids: Some(vec![42, 43]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stale = store.stale_associations(1, id).await.unwrap();
        assert_eq!(stale.table_ids, vec![43]);
        assert!(stale.datasource_ids.is_empty());
        assert!(stale.field_ids.is_empty());

        let global = store.create(1, &gmv()).await.unwrap();
        assert!(store.stale_associations(1, global).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_without_embedder_is_config_error() {
        let store = TerminologyStore::new(Arc::new(MemoryTerminologyRepository::new()));
        let id = store.create(1, &gmv()).await.unwrap();
        assert!(matches!(
            store.refresh_embeddings(1, id).await.unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(
            store.stale_associations(1, id).await.unwrap_err(),
            Error::Config(_)
        ));
    }
}
