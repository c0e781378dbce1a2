//! Ollama embedding backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use termscope_core::{defaults, EmbeddingBackend, Error, Result, Vector};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = defaults::OLLAMA_URL;

/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = defaults::EMBED_MODEL;

/// Default embedding dimension for nomic-embed-text.
pub const DEFAULT_DIMENSION: usize = defaults::EMBED_DIMENSION;

/// Timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = defaults::EMBED_TIMEOUT_SECS;

/// Connection settings for [`OllamaEmbedder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_EMBED_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            timeout_secs: EMBED_TIMEOUT_SECS,
        }
    }
}

impl OllamaConfig {
    /// Read `OLLAMA_BASE`, `OLLAMA_EMBED_MODEL`, `OLLAMA_EMBED_DIM` and
    /// `TERMSCOPE_EMBED_TIMEOUT_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            base_url: lookup("OLLAMA_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.base_url),
            model: lookup("OLLAMA_EMBED_MODEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.model),
            dimension: lookup("OLLAMA_EMBED_DIM")
                .and_then(|v| v.parse().ok())
                .filter(|d: &usize| *d > 0)
                .unwrap_or(defaults.dimension),
            timeout_secs: lookup("TERMSCOPE_EMBED_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|s: &u64| *s > 0)
                .unwrap_or(defaults.timeout_secs),
        }
    }
}

/// Embedding backend that calls Ollama's `/api/embed` endpoint.
pub struct OllamaEmbedder {
    client: Client,
    config: OllamaConfig,
}

impl OllamaEmbedder {
    /// Create an embedder with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(OllamaConfig::default())
    }

    /// Create an embedder with custom configuration.
    pub fn with_config(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "inference",
            component = "ollama",
            url = %config.base_url,
            model = %config.model,
            dimension = config.dimension,
            "Initializing Ollama embedder"
        );

        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::with_config(OllamaConfig::from_env())
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "ollama", op = "embed_texts", model = %self.config.model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();

        let request = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.config.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse response: {}", e)))?;

        if result.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "Ollama returned {} embeddings for {} inputs",
                result.embeddings.len(),
                texts.len()
            )));
        }

        if let Some(bad) = result
            .embeddings
            .iter()
            .find(|v| v.len() != self.config.dimension)
        {
            warn!(
                expected = self.config.dimension,
                actual = bad.len(),
                "Embedding dimension differs from configuration"
            );
        }

        let vectors: Vec<Vector> = result.embeddings.into_iter().map(Vector::from).collect();
        let elapsed = start.elapsed().as_millis() as u64;

        debug!(
            result_count = vectors.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > defaults::EMBED_SLOW_MS {
            warn!(
                duration_ms = elapsed,
                input_count = texts.len(),
                slow = true,
                "Slow embedding operation"
            );
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn embedder_for(server: &MockServer, dimension: usize) -> OllamaEmbedder {
        OllamaEmbedder::with_config(OllamaConfig {
            base_url: server.uri(),
            model: "test-embed".to_string(),
            dimension,
            timeout_secs: 5,
        })
        .unwrap()
    }

    // ==========================================================================
    // Configuration Tests
    // ==========================================================================

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_EMBED_MODEL, "nomic-embed-text");
        assert_eq!(DEFAULT_DIMENSION, 768);
        assert_eq!(EMBED_TIMEOUT_SECS, 30);
    }

    #[test]
    fn test_config_from_lookup_defaults() {
        let config = OllamaConfig::from_lookup(|_| None);
        assert_eq!(config, OllamaConfig::default());
    }

    #[test]
    fn test_config_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OLLAMA_BASE", "http://gpu-box:11434/"),
            ("OLLAMA_EMBED_MODEL", "mxbai-embed-large"),
            ("OLLAMA_EMBED_DIM", "1024"),
            ("TERMSCOPE_EMBED_TIMEOUT_SECS", "10"),
        ]);
        let config = OllamaConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.base_url, "http://gpu-box:11434");
        assert_eq!(config.model, "mxbai-embed-large");
        assert_eq!(config.dimension, 1024);
        assert_eq!(config.timeout_secs, 10);
    }

    #[test]
    fn test_config_ignores_invalid_numbers() {
        let vars: HashMap<&str, &str> =
            HashMap::from([("OLLAMA_EMBED_DIM", "0"), ("TERMSCOPE_EMBED_TIMEOUT_SECS", "soon")]);
        let config = OllamaConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.dimension, DEFAULT_DIMENSION);
        assert_eq!(config.timeout_secs, EMBED_TIMEOUT_SECS);
    }

    // ==========================================================================
    // HTTP Tests
    // ==========================================================================

    #[tokio::test]
    async fn test_embed_texts_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_json(serde_json::json!({
                "model": "test-embed",
                "input": ["GMV", "status"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-embed",
                "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = embedder_for(&server, 3);
        let vectors = embedder
            .embed_texts(&["GMV".to_string(), "status".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1].as_slice(), &[0.4, 0.5, 0.6]);
    }

    #[tokio::test]
    async fn test_embed_single_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[1.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let embedder = embedder_for(&server, 2);
        let vector = embedder.embed("GMV").await.unwrap();
        assert_eq!(vector.as_slice(), &[1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_empty_input_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let embedder = embedder_for(&server, 3);
        assert!(embedder.embed_texts(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_embedding_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let err = embedder_for(&server, 3).embed("GMV").await.unwrap_err();
        match err {
            Error::Embedding(msg) => assert!(msg.contains("model not loaded")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_count_mismatch_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2, 0.3]]
            })))
            .mount(&server)
            .await;

        let result = embedder_for(&server, 3)
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await;
        assert!(matches!(result, Err(Error::Embedding(_))));
    }

    #[tokio::test]
    async fn test_malformed_body_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let result = embedder_for(&server, 3).embed("GMV").await;
        assert!(matches!(result, Err(Error::Embedding(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_error() {
        let embedder = OllamaEmbedder::with_config(OllamaConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            embedder.embed("GMV").await,
            Err(Error::Embedding(_))
        ));
    }

    #[test]
    fn test_backend_metadata() {
        let embedder = OllamaEmbedder::new().unwrap();
        assert_eq!(embedder.model_name(), DEFAULT_EMBED_MODEL);
        assert_eq!(embedder.dimension(), DEFAULT_DIMENSION);
    }
}
