//! Centralized default constants for termscope.
//!
//! Crates reference these instead of defining their own magic numbers.

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for list operations.
pub const PAGE_SIZE: i64 = 10;

/// Largest page size a caller may request; larger values are clamped.
pub const PAGE_SIZE_MAX: i64 = 100;

/// First page number (pages are 1-based).
pub const FIRST_PAGE: i64 = 1;

// =============================================================================
// TERMINOLOGY
// =============================================================================

/// Maximum length of a terminology word, in characters.
pub const WORD_MAX_LEN: usize = 255;

// =============================================================================
// RESOLUTION
// =============================================================================

/// Default number of terminology entries returned by `resolve`.
pub const TOP_K: usize = 10;

/// Upper bound applied to caller-supplied `top_k`.
pub const TOP_K_MAX: usize = 100;

// =============================================================================
// EMBEDDING
// =============================================================================

/// Default Ollama endpoint.
pub const OLLAMA_URL: &str = "http://localhost:11434";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Timeout for a single embedding request.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Embedding calls slower than this are logged at WARN.
pub const EMBED_SLOW_MS: u64 = 5_000;

// =============================================================================
// BACKFILL WORKER
// =============================================================================

/// Rows embedded per backfill batch.
pub const BACKFILL_BATCH_SIZE: i64 = 32;

/// Sleep between polls when no rows are pending.
pub const BACKFILL_POLL_INTERVAL_MS: u64 = 5_000;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;
