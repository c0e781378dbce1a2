//! # termscope-inference
//!
//! Embedding backends for termscope.
//!
//! The resolution engine treats embedding as a best-effort black box
//! (`embed(text) -> vector`). This crate provides:
//!
//! - [`OllamaEmbedder`]: HTTP client for a local or remote Ollama server
//! - [`mock::MockEmbedder`]: deterministic in-process embedder for tests
//!   (feature `mock`)
//!
//! ## Example
//!
//! ```ignore
//! use termscope_inference::{EmbeddingBackend, OllamaEmbedder};
//!
//! let embedder = OllamaEmbedder::from_env()?;
//! let vector = embedder.embed("gross merchandise value").await?;
//! assert_eq!(vector.as_slice().len(), embedder.dimension());
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use termscope_core::*;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaEmbedder};
