//! Mock embedding backend for deterministic testing.
//!
//! Texts registered with [`MockEmbedder::with_vector`] embed to exactly that
//! vector; anything else gets a stable pseudo-random unit vector derived from
//! the text bytes, so repeated runs rank identically.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use termscope_inference::mock::MockEmbedder;
//!
//! let embedder = MockEmbedder::new(3)
//!     .with_vector("GMV", vec![1.0, 0.0, 0.0])
//!     .with_vector("gross merchandise value", vec![0.9, 0.1, 0.0]);
//!
//! let v = embedder.embed("GMV").await?;
//! assert_eq!(v.as_slice(), &[1.0, 0.0, 0.0]);
//!
//! embedder.set_failing(true);
//! assert!(embedder.embed("GMV").await.is_err());
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use termscope_core::{EmbeddingBackend, Error, Result, Vector};

/// Deterministic in-process embedder.
///
/// Clones share the failure switch and the call log.
#[derive(Clone)]
pub struct MockEmbedder {
    dimension: usize,
    fixed: Arc<HashMap<String, Vec<f32>>>,
    rejected: Arc<HashSet<String>>,
    failing: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fixed: Arc::new(HashMap::new()),
            rejected: Arc::new(HashSet::new()),
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pin the vector returned for `text`.
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        Arc::make_mut(&mut self.fixed).insert(text.into(), vector);
        self
    }

    /// Fail any call whose input contains `text`, like a backend that
    /// chokes on one particular input.
    pub fn rejecting(mut self, text: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.rejected).insert(text.into());
        self
    }

    /// Start in the failing state.
    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    /// Make every subsequent call return `Error::Embedding`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed_texts` calls, including failed ones.
    pub fn call_count(&self) -> usize {
        self.log().len()
    }

    /// Every text passed in, in call order.
    pub fn embedded_texts(&self) -> Vec<String> {
        self.log().iter().flatten().cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.log().clear();
    }

    fn log(&self) -> MutexGuard<'_, Vec<Vec<String>>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        match self.fixed.get(text) {
            Some(v) => v.clone(),
            None => hashed_unit_vector(text, self.dimension),
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

/// FNV-1a seeded xorshift, normalized to unit length.
fn hashed_unit_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut state = text.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    });
    if state == 0 {
        state = 1;
    }
    let mut values: Vec<f32> = (0..dimension)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect();
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

#[async_trait]
impl EmbeddingBackend for MockEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.log().push(texts.to_vec());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Embedding("mock embedder unavailable".to_string()));
        }
        if let Some(bad) = texts.iter().find(|t| self.rejected.contains(*t)) {
            return Err(Error::Embedding(format!("mock embedder rejected {:?}", bad)));
        }
        Ok(texts
            .iter()
            .map(|t| Vector::from(self.vector_for(t)))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}
