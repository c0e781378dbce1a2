//! # termscope-resolve
//!
//! Service layer for termscope.
//!
//! - [`DimensionRegistry`]: CRUD and integrity rules for dimension value sets
//! - [`TerminologyStore`]: CRUD, synonyms and embedding lifecycle for
//!   terminology entries
//! - [`ResolutionEngine`]: scope gate plus vector ranking for a query context
//! - [`CatalogUsageGuard`]: blocks deleting dimensions the catalog still uses
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use termscope_resolve::{ResolverServices, ResolverConfig, EmbeddingPolicy, QueryContext};
//! use termscope_db::Database;
//! use termscope_inference::OllamaEmbedder;
//!
//! let db = Database::connect(&std::env::var("DATABASE_URL")?).await?;
//! let embedder = Arc::new(OllamaEmbedder::from_env()?);
//! let services = ResolverServices::from_database(
//!     &db,
//!     embedder,
//!     ResolverConfig::from_env(),
//!     EmbeddingPolicy::from_env(),
//! );
//!
//! let ctx = QueryContext::new(1).with_datasource(3).with_tables([42]);
//! let resolution = services.engine.resolve(&ctx, "orders by GMV", 5).await?;
//! let dimensions = services.engine.resolve_dimensions(&ctx).await?;
//! ```

pub mod config;
pub mod engine;
pub mod guard;
pub mod registry;
pub mod store;

use std::sync::Arc;

// Re-export core types
pub use termscope_core::*;

pub use config::{EmbeddingPolicy, ResolverConfig};
pub use engine::{Resolution, ResolutionEngine, ResolutionMode, ResolvedTerm};
pub use guard::CatalogUsageGuard;
pub use registry::DimensionRegistry;
pub use store::{StaleAssociations, TerminologyStore};

use termscope_db::Database;

/// The three services wired over one set of collaborators.
pub struct ResolverServices {
    pub dimensions: DimensionRegistry,
    pub terminology: TerminologyStore,
    pub engine: ResolutionEngine,
}

impl ResolverServices {
    /// Wire every service over explicit collaborators.
    ///
    /// Dimension deletes are guarded by catalog usage.
    pub fn new(
        terminology: Arc<dyn TerminologyRepository>,
        dimensions: Arc<dyn DimensionRepository>,
        catalog: Arc<dyn CatalogLookup>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: ResolverConfig,
        policy: EmbeddingPolicy,
    ) -> Self {
        Self {
            dimensions: DimensionRegistry::new(dimensions.clone())
                .with_guard(Arc::new(CatalogUsageGuard::new(catalog.clone()))),
            terminology: TerminologyStore::new(terminology.clone())
                .with_embedder(embedder.clone(), policy)
                .with_catalog(catalog.clone()),
            engine: ResolutionEngine::new(terminology, dimensions, catalog, embedder, config),
        }
    }

    /// Wire every service over the Postgres repositories.
    pub fn from_database(
        db: &Database,
        embedder: Arc<dyn EmbeddingBackend>,
        config: ResolverConfig,
        policy: EmbeddingPolicy,
    ) -> Self {
        Self::new(
            Arc::new(db.terminology.clone()),
            Arc::new(db.dimensions.clone()),
            Arc::new(db.catalog.clone()),
            embedder,
            config,
            policy,
        )
    }
}
