//! Catalog-backed dimension usage guard.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use termscope_core::{
    CatalogLookup, ConflictReason, DimensionUsageGuard, DimensionValueSet, EntityKind, Error,
    Result,
};

/// Blocks deleting a dimension while any catalog field references its code.
pub struct CatalogUsageGuard {
    catalog: Arc<dyn CatalogLookup>,
}

impl CatalogUsageGuard {
    pub fn new(catalog: Arc<dyn CatalogLookup>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl DimensionUsageGuard for CatalogUsageGuard {
    async fn check_delete(&self, dimension: &DimensionValueSet) -> Result<()> {
        let fields = self
            .catalog
            .count_fields_using_dimension(dimension.oid, &dimension.code)
            .await?;
        if fields > 0 {
            info!(
                subsystem = "resolve",
                component = "catalog_usage_guard",
                op = "check_delete",
                oid = dimension.oid,
                dimension_id = dimension.id,
                fields,
                "Dimension delete blocked by catalog usage"
            );
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
