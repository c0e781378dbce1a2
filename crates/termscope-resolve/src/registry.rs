//! Dimension registry: CRUD and integrity rules for dimension value sets.
//!
//! The repository re-validates code uniqueness and system protection inside
//! the write transaction. The registry adds request validation, the
//! pre-delete guards, and logging.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use termscope_core::{
    CreateDimensionRequest, DimensionFilter, DimensionRepository, DimensionSummary,
    DimensionUsageGuard, DimensionValueSet, EntityKind, Error, ForbiddenReason, OrgId, Page,
    PageRequest, Result, UpdateDimensionRequest, UserId,
};

/// Service over a [`DimensionRepository`].
pub struct DimensionRegistry {
    repo: Arc<dyn DimensionRepository>,
    guards: Vec<Arc<dyn DimensionUsageGuard>>,
}

impl DimensionRegistry {
    pub fn new(repo: Arc<dyn DimensionRepository>) -> Self {
        Self {
            repo,
            guards: Vec::new(),
        }
    }

    /// Register a check that runs before every delete.
    pub fn with_guard(mut self, guard: Arc<dyn DimensionUsageGuard>) -> Self {
        self.register_guard(guard);
        self
    }

    pub fn register_guard(&mut self, guard: Arc<dyn DimensionUsageGuard>) {
        self.guards.push(guard);
    }

    pub async fn list(
        &self,
        oid: OrgId,
        filter: &DimensionFilter,
        page: PageRequest,
    ) -> Result<Page<DimensionValueSet>> {
        self.repo.list(oid, filter, page).await
    }

    pub async fn get(&self, oid: OrgId, id: i64) -> Result<DimensionValueSet> {
        self.repo
            .get(oid, id)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Dimension, id))
    }

    pub async fn list_all(&self, oid: OrgId, enabled_only: bool) -> Result<Vec<DimensionSummary>> {
        self.repo.list_all(oid, enabled_only).await
    }

    #[instrument(skip(self, req), fields(subsystem = "resolve", component = "dimension_registry", op = "create", code = %req.code.trim()))]
    pub async fn create(
        &self,
        oid: OrgId,
        req: &CreateDimensionRequest,
        actor: UserId,
    ) -> Result<i64> {
        let new = req.validate()?;
        warn_stale_labels(&new.code, &new.stale_label_keys());
        let id = self.repo.create(oid, &new, actor).await?;
        info!(dimension_id = id, "Dimension created");
        Ok(id)
    }

    #[instrument(skip(self, req), fields(subsystem = "resolve", component = "dimension_registry", op = "update"))]
    pub async fn update(
        &self,
        oid: OrgId,
        id: i64,
        req: &UpdateDimensionRequest,
        actor: UserId,
    ) -> Result<DimensionValueSet> {
        let updated = self.repo.update(oid, id, req, actor).await?;
        warn_stale_labels(&updated.code, &updated.stale_label_keys());
        info!(code = %updated.code, "Dimension updated");
        Ok(updated)
    }

    /// Delete a user entry after every registered guard allows it.
    #[instrument(skip(self), fields(subsystem = "resolve", component = "dimension_registry", op = "delete"))]
    pub async fn delete(&self, oid: OrgId, id: i64) -> Result<DimensionValueSet> {
        let existing = self.get(oid, id).await?;
        if existing.is_system {
            return Err(Error::Forbidden {
                entity: EntityKind::Dimension,
                id,
                reason: ForbiddenReason::SystemEntryDelete,
            });
        }
        for guard in &self.guards {
            guard.check_delete(&existing).await?;
        }
        let removed = self.repo.delete(oid, id).await?;
        info!(code = %removed.code, "Dimension deleted");
        Ok(removed)
    }

    #[instrument(skip(self), fields(subsystem = "resolve", component = "dimension_registry", op = "set_enabled"))]
    pub async fn set_enabled(
        &self,
        oid: OrgId,
        id: i64,
        enabled: bool,
        actor: UserId,
    ) -> Result<()> {
        self.repo.set_enabled(oid, id, enabled, actor).await
    }

    /// Seed platform dictionaries. Codes already present are left alone.
    #[instrument(skip(self, seeds), fields(subsystem = "resolve", component = "dimension_registry", op = "seed_system", seed_count = seeds.len()))]
    pub async fn seed_system(&self, oid: OrgId, seeds: &[CreateDimensionRequest]) -> Result<usize> {
        let validated = seeds
            .iter()
            .map(CreateDimensionRequest::validate)
            .collect::<Result<Vec<_>>>()?;
        let inserted = self.repo.seed_system(oid, &validated).await?;
        info!(inserted, "System dimensions seeded");
        Ok(inserted)
    }
}

fn warn_stale_labels(code: &str, stale: &[&str]) {
    if !stale.is_empty() {
        warn!(
            code,
            stale_keys = ?stale,
            "Dimension labels reference values not in the value list"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use termscope_core::{ConflictReason, ValidationRule};
    use termscope_db::MemoryDimensionRepository;

    fn order_status() -> CreateDimensionRequest {
        CreateDimensionRequest {
            name: "Order Status".to_string(),
            code: "order_status".to_string(),
            values: vec!["pending".to_string(), "completed".to_string()],
            value_labels: Some(BTreeMap::from([(
                "completed".to_string(),
                "Completed".to_string(),
            )])),
            ..Default::default()
        }
    }

    fn registry() -> (DimensionRegistry, Arc<MemoryDimensionRepository>) {
        let repo = Arc::new(MemoryDimensionRepository::new());
        (DimensionRegistry::new(repo.clone()), repo)
    }

    struct CountingGuard {
        calls: AtomicUsize,
        block: bool,
    }

    #[async_trait]
    impl DimensionUsageGuard for CountingGuard {
        async fn check_delete(&self, dimension: &DimensionValueSet) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block {
                return Err(Error::Conflict {
                    entity: EntityKind::Dimension,
                    field: "code",
                    value: dimension.code.clone(),
                    reason: ConflictReason::InUse,
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name_and_code() {
        let (registry, _) = registry();
        let blank_name = CreateDimensionRequest {
            name: "   ".to_string(),
            ..order_status()
        };
        let err = registry.create(1, &blank_name, 1).await.unwrap_err();
        assert_eq!(err.message_key(), "i18n_dimension.name_required");

        let blank_code = CreateDimensionRequest {
            code: "".to_string(),
            ..order_status()
        };
        let err = registry.create(1, &blank_code, 1).await.unwrap_err();
        assert_eq!(err.message_key(), "i18n_dimension.code_required");
    }

    #[tokio::test]
    async fn test_code_uniqueness_trims_but_keeps_case() {
        let (registry, _) = registry();
        let status = CreateDimensionRequest {
            code: "Status".to_string(),
            ..order_status()
        };
        registry.create(1, &status, 1).await.unwrap();

        let padded = CreateDimensionRequest {
            code: " Status ".to_string(),
            ..order_status()
        };
        let err = registry.create(1, &padded, 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict {
                reason: ConflictReason::Duplicate,
                ..
            }
        ));

        let lower = CreateDimensionRequest {
            code: " status ".to_string(),
            ..order_status()
        };
        assert!(registry.create(1, &lower, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_system_dimension_code_is_immutable() {
        let (registry, _) = registry();
        assert_eq!(registry.seed_system(1, &[order_status()]).await.unwrap(), 1);
        let id = registry.list_all(1, false).await.unwrap()[0].id;

        let err = registry
            .update(
                1,
                id,
                &UpdateDimensionRequest {
                    code: Some("new_status".to_string()),
                    ..Default::default()
                },
                2,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                rule: ValidationRule::Immutable,
                ..
            }
        ));

        let renamed = registry
            .update(
                1,
                id,
                &UpdateDimensionRequest {
                    name: Some("Order Status v2".to_string()),
                    ..Default::default()
                },
                2,
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Order Status v2");
        assert_eq!(renamed.code, "order_status");

        // Same code is not a change.
        let relabeled = registry
            .update(
                1,
                id,
                &UpdateDimensionRequest {
                    code: Some(" order_status ".to_string()),
                    value_labels: Some(BTreeMap::from([(
                        "pending".to_string(),
                        "Waiting".to_string(),
                    )])),
                    ..Default::default()
                },
                2,
            )
            .await
            .unwrap();
        assert_eq!(relabeled.label_for("pending"), Some("Waiting"));
    }

    #[tokio::test]
    async fn test_system_dimension_cannot_be_deleted() {
        let guard = Arc::new(CountingGuard {
            calls: AtomicUsize::new(0),
            block: false,
        });
        let (registry, _) = registry();
        let registry = registry.with_guard(guard.clone());
        registry.seed_system(1, &[order_status()]).await.unwrap();
        let id = registry.list_all(1, false).await.unwrap()[0].id;

        let err = registry.delete(1, id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
        assert_eq!(err.message_key(), "i18n_dimension.system_cannot_delete");
        assert_eq!(guard.calls.load(Ordering::SeqCst), 0);
        assert!(registry.get(1, id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_runs_guards() {
        let blocking = Arc::new(CountingGuard {
            calls: AtomicUsize::new(0),
            block: true,
        });
        let (registry, _) = registry();
        let registry = registry.with_guard(blocking.clone());
        let id = registry.create(1, &order_status(), 1).await.unwrap();

        let err = registry.delete(1, id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict {
                reason: ConflictReason::InUse,
                ..
            }
        ));
        assert_eq!(blocking.calls.load(Ordering::SeqCst), 1);
        assert!(registry.get(1, id).await.is_ok());

        let (open, _) = self::registry();
        let id = open.create(1, &order_status(), 1).await.unwrap();
        assert_eq!(open.delete(1, id).await.unwrap().id, id);
        assert!(matches!(
            open.delete(1, id).await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_set_enabled_is_idempotent() {
        let (registry, _) = registry();
        let id = registry.create(1, &order_status(), 1).await.unwrap();
        registry.set_enabled(1, id, false, 2).await.unwrap();
        registry.set_enabled(1, id, false, 2).await.unwrap();
        let stored = registry.get(1, id).await.unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.update_by, Some(2));

        assert!(matches!(
            registry.set_enabled(1, 999, true, 2).await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_list_orders_by_creation_time_desc() {
        let (registry, repo) = registry();
        let base = Utc::now();
        for (id, code, age_secs) in [(1, "a", 30), (2, "b", 10), (3, "c", 20)] {
            repo.insert_raw(DimensionValueSet {
                id,
                oid: 1,
                name: code.to_string(),
                code: code.to_string(),
                description: None,
                values: vec![],
                value_labels: BTreeMap::new(),
                is_system: false,
                enabled: true,
                create_time: base - chrono::Duration::seconds(age_secs),
                update_time: None,
                create_by: None,
                update_by: None,
            })
            .await;
        }

        let page = registry
            .list(1, &DimensionFilter::default(), PageRequest::new(1, 10))
            .await
            .unwrap();
        let codes: Vec<&str> = page.items.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["b", "c", "a"]);
        assert_eq!(page.total_count, 3);

        let page = registry
            .list(1, &DimensionFilter::default(), PageRequest::new(9, 0))
            .await
            .unwrap();
        assert_eq!(page.page_size, 1);
        assert_eq!(page.current_page, 3);
        assert_eq!(page.items[0].code, "a");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (registry, _) = registry();
        let err = registry.get(1, 42).await.unwrap_err();
        assert_eq!(err.message_key(), "i18n_dimension.not_found");
    }
}
