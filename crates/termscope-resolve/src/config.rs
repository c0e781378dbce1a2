//! Resolver configuration from environment variables.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `TERMSCOPE_DEFAULT_TOP_K` | 10 | `top_k` used by `resolve_default` |
//! | `TERMSCOPE_MAX_TOP_K` | 100 | larger `top_k` values are clamped |
//! | `TERMSCOPE_MAX_DISTANCE` | unset | drop ranked candidates farther than this |
//! | `TERMSCOPE_DISTANCE_METRIC` | `cosine` | `cosine` or `l2` |
//! | `TERMSCOPE_EMBED_ON_WRITE` | `true` | embed inline after writes, else defer to the backfill worker |

use tracing::warn;

use termscope_core::{defaults, DistanceMetric};

/// Tuning for [`ResolutionEngine`](crate::ResolutionEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Ranked candidates with a larger distance are discarded.
    pub max_distance: Option<f32>,
    pub metric: DistanceMetric,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_top_k: defaults::TOP_K,
            max_top_k: defaults::TOP_K_MAX,
            max_distance: None,
            metric: DistanceMetric::default(),
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = Self::default();
        let positive = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
        };

        let metric = match lookup("TERMSCOPE_DISTANCE_METRIC") {
            Some(raw) => raw.parse::<DistanceMetric>().unwrap_or_else(|e| {
                warn!(subsystem = "resolve", error = %e, "Falling back to cosine distance");
                DistanceMetric::default()
            }),
            None => base.metric,
        };

        Self {
            default_top_k: positive("TERMSCOPE_DEFAULT_TOP_K").unwrap_or(base.default_top_k),
            max_top_k: positive("TERMSCOPE_MAX_TOP_K").unwrap_or(base.max_top_k),
            max_distance: lookup("TERMSCOPE_MAX_DISTANCE")
                .and_then(|v| v.trim().parse::<f32>().ok())
                .filter(|d| d.is_finite() && *d >= 0.0),
            metric,
        }
        .normalized()
    }

    pub fn with_default_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k.max(1);
        self.normalized()
    }

    pub fn with_max_top_k(mut self, max: usize) -> Self {
        self.max_top_k = max.max(1);
        self.normalized()
    }

    pub fn with_max_distance(mut self, max_distance: Option<f32>) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Keep `default_top_k` within `max_top_k`.
    fn normalized(mut self) -> Self {
        self.default_top_k = self.default_top_k.min(self.max_top_k);
        self
    }
}

/// When terminology embeddings are computed after a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmbeddingPolicy {
    /// Embed right after the write; failures leave the row pending.
    #[default]
    Inline,
    /// Leave rows pending for the backfill worker.
    Deferred,
}

impl EmbeddingPolicy {
    pub fn from_env() -> Self {
        Self::from_flag(std::env::var("TERMSCOPE_EMBED_ON_WRITE").ok().as_deref())
    }

    fn from_flag(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("false" | "0" | "no" | "off") => Self::Deferred,
            _ => Self::Inline,
        }
    }
}
