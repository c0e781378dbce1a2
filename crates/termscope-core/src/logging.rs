//! Structured logging schema and field name constants for termscope.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Failure requiring operator attention |
//! | WARN  | Degraded mode or data-quality issue, fallback applied |
//! | INFO  | Lifecycle events, completed mutations |
//! | DEBUG | Decision points, intermediate counts |
//! | TRACE | Per-candidate scoring |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation id for a single resolution request (UUIDv7).
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "db", "resolve", "inference", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "dimension_registry", "terminology_store", "resolution_engine", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "create", "update", "resolve", "embed_texts"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Organization (tenant) id.
pub const ORG_ID: &str = "oid";

/// Terminology entry id.
pub const ENTRY_ID: &str = "entry_id";

/// Dimension value set id.
pub const DIMENSION_ID: &str = "dimension_id";

/// Acting user id.
pub const ACTOR: &str = "actor";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of results returned.
pub const RESULT_COUNT: &str = "result_count";

/// Number of candidates surviving the scope gate.
pub const CANDIDATE_COUNT: &str = "candidate_count";

/// Number of input texts sent to an embedding model.
pub const INPUT_COUNT: &str = "input_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Resolution fell back to scope-only ordering.
pub const DEGRADED: &str = "degraded";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Slow operation threshold exceeded.
pub const SLOW: &str = "slow";
