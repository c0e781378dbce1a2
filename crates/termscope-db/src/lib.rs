//! # termscope-db
//!
//! PostgreSQL persistence for termscope.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for terminology entries and dimension value sets
//! - Scope pre-filtering with JSONB containment over GIN-indexed association lists
//! - Embedding storage with pgvector
//! - A read-only adapter over the schema catalog
//! - In-process stores implementing the same traits ([`memory`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use termscope_db::{Database, DimensionRepository, CreateDimensionRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/termscope").await?;
//!
//!     let new = CreateDimensionRequest {
//!         name: "Order Status".to_string(),
//!         code: "order_status".to_string(),
//!         values: vec!["pending".to_string(), "completed".to_string()],
//!         ..Default::default()
//!     }
//!     .validate()?;
//!     let id = db.dimensions.create(1, &new, 42).await?;
//!
//!     println!("Created dimension: {}", id);
//!     Ok(())
//! }
//! ```
pub mod catalog;
pub mod dimensions;
pub mod memory;
pub mod pool;
pub mod terminology;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use termscope_core::*;

pub use catalog::PgCatalogLookup;
pub use dimensions::PgDimensionRepository;
pub use memory::{MemoryDimensionRepository, MemoryTerminologyRepository, StaticCatalog};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig, PoolStats};
pub use terminology::PgTerminologyRepository;

/// Escape LIKE/ILIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// `%input%` pattern for a case-insensitive substring filter, or `None` when
/// the filter is blank.
pub(crate) fn contains_pattern(input: Option<&str>) -> Option<String> {
    input
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", escape_like(s)))
}

/// True for Postgres SQLSTATE 23505 (unique_violation).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Terminology entries and their synonyms.
    pub terminology: PgTerminologyRepository,
    /// Dimension value sets.
    pub dimensions: PgDimensionRepository,
    /// Read-only schema catalog adapter.
    pub catalog: PgCatalogLookup,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            terminology: PgTerminologyRepository::new(pool.clone()),
            dimensions: PgDimensionRepository::new(pool.clone()),
            catalog: PgCatalogLookup::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
