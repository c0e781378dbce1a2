//! # termscope-jobs
//!
//! Background embedding backfill for termscope.
//!
//! Terminology rows may be written without an embedding (deferred embedding,
//! or the backend was down at write time). Such rows are simply not rankable
//! until [`EmbeddingBackfillWorker`] fills them in.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use termscope_db::Database;
//! use termscope_inference::OllamaEmbedder;
//! use termscope_jobs::{BackfillConfig, EmbeddingBackfillWorker};
//!
//! let db = Database::connect("postgres://...").await?;
//! let worker = EmbeddingBackfillWorker::new(
//!     Arc::new(db.terminology.clone()),
//!     Arc::new(OllamaEmbedder::from_env()?),
//!     BackfillConfig::from_env(),
//! );
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.shutdown().await?;
//! ```

pub mod worker;

pub use worker::{BackfillConfig, BackfillEvent, BatchOutcome, EmbeddingBackfillWorker, WorkerHandle};

/// Default number of rows embedded per poll.
pub const DEFAULT_BATCH_SIZE: i64 = termscope_core::defaults::BACKFILL_BATCH_SIZE;

/// Default polling interval when nothing is pending (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = termscope_core::defaults::BACKFILL_POLL_INTERVAL_MS;
