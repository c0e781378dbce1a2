//! Embedding backfill worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use termscope_core::{EmbeddingBackend, Error, Result, TerminologyRepository, Vector};

use crate::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL_MS};

/// Configuration for the backfill worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Sleep between polls when no full batch is pending, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum rows embedded per batch.
    pub batch_size: i64,
    /// Whether the worker runs at all.
    pub enabled: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            enabled: true,
        }
    }
}

impl BackfillConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EMBED_WORKER_ENABLED` | `true` | Enable/disable the backfill |
    /// | `EMBED_WORKER_BATCH_SIZE` | `32` | Rows embedded per batch |
    /// | `EMBED_WORKER_POLL_INTERVAL_MS` | `5000` | Polling interval when idle |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("EMBED_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let batch_size = lookup("EMBED_WORKER_BATCH_SIZE")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let poll_interval_ms = lookup("EMBED_WORKER_POLL_INTERVAL_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        Self {
            poll_interval_ms,
            batch_size,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the batch size; values below 1 become 1.
    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows found without an embedding.
    pub pending: usize,
    /// Embeddings written.
    pub stored: usize,
    /// Rows whose text changed (or that vanished) while embedding.
    pub skipped: usize,
    /// Rows the backend refused on their own; set aside until their text
    /// changes or the worker restarts.
    pub rejected: usize,
}

/// Event emitted by the backfill worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillEvent {
    WorkerStarted,
    /// A non-empty batch was processed.
    BatchStored { stored: usize, skipped: usize },
    /// A batch failed; the rows stay pending for the next poll.
    BatchFailed { error: String },
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<BackfillEvent>,
}

impl WorkerHandle {
    /// Signal the worker to stop after the batch in flight.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Receiver for events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<BackfillEvent> {
        self.event_rx.resubscribe()
    }
}

/// Computes embeddings for terminology rows that have none.
pub struct EmbeddingBackfillWorker {
    terminology: Arc<dyn TerminologyRepository>,
    embedder: Arc<dyn EmbeddingBackend>,
    config: BackfillConfig,
    event_tx: broadcast::Sender<BackfillEvent>,
    /// Entry id to the text the backend refused for it.
    rejected: Mutex<HashMap<i64, String>>,
}

impl EmbeddingBackfillWorker {
    pub fn new(
        terminology: Arc<dyn TerminologyRepository>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: BackfillConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(termscope_core::defaults::EVENT_BUS_CAPACITY);
        Self {
            terminology,
            embedder,
            config,
            event_tx,
            rejected: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Receiver for worker events. Subscribe before [`start`](Self::start)
    /// to observe `WorkerStarted`.
    pub fn events(&self) -> broadcast::Receiver<BackfillEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker loop and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Embed and store one batch of pending rows.
    ///
    /// The whole batch goes to the backend in one call. When that call
    /// fails, each row is retried alone; rows the backend still refuses are
    /// set aside so they stop holding back the rest of the queue. If every
    /// row fails alone too, the backend is considered down and the batch
    /// error is returned. A row whose text changed in the meantime is
    /// counted as skipped; it is listed again with its new text.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "embedding_backfill", op = "run_once"))]
    pub async fn run_once(&self) -> Result<BatchOutcome> {
        let rejected = self.rejected.lock().await.clone();
        let targets: Vec<_> = self
            .terminology
            .list_pending_embeddings(self.config.batch_size.saturating_add(rejected.len() as i64))
            .await?
            .into_iter()
            .filter(|t| rejected.get(&t.id) != Some(&t.text()))
            .take(self.config.batch_size.max(1) as usize)
            .collect();
        if targets.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let start = Instant::now();
        let texts: Vec<String> = targets.iter().map(|t| t.text()).collect();
        let vectors: Vec<Option<Vector>> = match self.embedder.embed_texts(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(Some).collect(),
            Ok(vectors) => {
                return Err(Error::Embedding(format!(
                    "backend returned {} embeddings for {} texts",
                    vectors.len(),
                    texts.len()
                )))
            }
            Err(e @ Error::Embedding(_)) if texts.len() > 1 => {
                debug!(error = %e, batch = texts.len(), "Batch embedding failed; retrying rows one by one");
                self.embed_individually(&texts, e).await?
            }
            Err(e) => return Err(e),
        };

        let mut outcome = BatchOutcome {
            pending: targets.len(),
            ..Default::default()
        };
        for ((target, text), vector) in targets.iter().zip(texts).zip(&vectors) {
            let Some(vector) = vector else {
                warn!(entry_id = target.id, oid = target.oid, "Embedding backend refused row; setting it aside");
                self.rejected.lock().await.insert(target.id, text);
                outcome.rejected += 1;
                continue;
            };
            if self.terminology.store_embedding(target, vector).await? {
                outcome.stored += 1;
            } else {
                debug!(entry_id = target.id, oid = target.oid, "Row changed while embedding");
                outcome.skipped += 1;
            }
        }

        info!(
            pending = outcome.pending,
            stored = outcome.stored,
            skipped = outcome.skipped,
            rejected = outcome.rejected,
            model = self.embedder.model_name(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding batch stored"
        );
        Ok(outcome)
    }

    /// One backend call per text. `None` marks a refused text; returns
    /// `batch_error` when nothing succeeds.
    async fn embed_individually(
        &self,
        texts: &[String],
        batch_error: Error,
    ) -> Result<Vec<Option<Vector>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            match self.embedder.embed(text).await {
                Ok(vector) => vectors.push(Some(vector)),
                Err(Error::Embedding(_)) => vectors.push(None),
                Err(e) => return Err(e),
            }
        }
        if vectors.iter().all(Option::is_none) {
            return Err(batch_error);
        }
        Ok(vectors)
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(
                subsystem = "jobs",
                component = "embedding_backfill",
                "Embedding backfill is disabled, not starting"
            );
            return;
        }

        info!(
            subsystem = "jobs",
            component = "embedding_backfill",
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Embedding backfill started"
        );
        let _ = self.event_tx.send(BackfillEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(subsystem = "jobs", "Embedding backfill received shutdown signal");
                break;
            }

            // A full batch means more rows are likely waiting.
            let more_pending = match self.run_once().await {
                Ok(outcome) => {
                    if outcome.pending > 0 {
                        let _ = self.event_tx.send(BackfillEvent::BatchStored {
                            stored: outcome.stored,
                            skipped: outcome.skipped,
                        });
                    }
                    outcome.pending as i64 >= self.config.batch_size && outcome.stored > 0
                }
                Err(e) => {
                    if matches!(e, Error::Embedding(_)) {
                        warn!(subsystem = "jobs", error = %e, "Embedding backend unavailable; retrying next poll");
                    } else {
                        error!(subsystem = "jobs", error = %e, "Embedding batch failed; retrying next poll");
                    }
                    let _ = self.event_tx.send(BackfillEvent::BatchFailed {
                        error: e.to_string(),
                    });
                    false
                }
            };

            if !more_pending {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "jobs", "Embedding backfill received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        let _ = self.event_tx.send(BackfillEvent::WorkerStopped);
        info!(subsystem = "jobs", component = "embedding_backfill", "Embedding backfill stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use termscope_core::CreateTerminologyRequest;
    use termscope_db::MemoryTerminologyRepository;
    use termscope_inference::mock::MockEmbedder;

    fn config_from(vars: &[(&str, &str)]) -> BackfillConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackfillConfig::from_lookup(|k| map.get(k).cloned())
    }

    async fn repo_with(words: &[(&str, &[&str])]) -> Arc<MemoryTerminologyRepository> {
        let repo = Arc::new(MemoryTerminologyRepository::new());
        for (word, synonyms) in words {
            let new = CreateTerminologyRequest {
                word: word.to_string(),
                description: Some(format!("{} definition", word)),
                other_words: synonyms.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
            .validate()
            .unwrap();
            repo.create(1, &new).await.unwrap();
        }
        repo
    }

    fn worker(
        repo: &Arc<MemoryTerminologyRepository>,
        embedder: &MockEmbedder,
        config: BackfillConfig,
    ) -> EmbeddingBackfillWorker {
        EmbeddingBackfillWorker::new(repo.clone(), Arc::new(embedder.clone()), config)
    }

    #[test]
    fn test_config_defaults() {
        let config = config_from(&[]);
        assert_eq!(config, BackfillConfig::default());
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.poll_interval_ms, 5_000);
        assert!(config.enabled);
    }

    #[test]
    fn test_config_overrides() {
        let config = config_from(&[
            ("EMBED_WORKER_ENABLED", "false"),
            ("EMBED_WORKER_BATCH_SIZE", "8"),
            ("EMBED_WORKER_POLL_INTERVAL_MS", "250"),
        ]);
        assert!(!config.enabled);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.poll_interval_ms, 250);

        assert!(!config_from(&[("EMBED_WORKER_ENABLED", "0")]).enabled);
    }

    #[test]
    fn test_config_rejects_invalid_batch_size() {
        assert_eq!(config_from(&[("EMBED_WORKER_BATCH_SIZE", "0")]).batch_size, 32);
        assert_eq!(config_from(&[("EMBED_WORKER_BATCH_SIZE", "lots")]).batch_size, 32);
        assert_eq!(BackfillConfig::default().with_batch_size(-3).batch_size, 1);
    }

    #[tokio::test]
    async fn test_run_once_embeds_parents_and_synonyms() {
        let repo = repo_with(&[("GMV", &["gross merchandise value"])]).await;
        let embedder = MockEmbedder::new(4);
        let worker = worker(&repo, &embedder, BackfillConfig::default());

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                pending: 2,
                stored: 2,
                ..Default::default()
            }
        );
        assert_eq!(embedder.call_count(), 1);
        let texts = embedder.embedded_texts();
        assert!(texts.contains(&"GMV: GMV definition".to_string()));
        assert!(texts.contains(&"gross merchandise value: GMV definition".to_string()));
        assert!(repo.list_pending_embeddings(10).await.unwrap().is_empty());

        // Nothing left: no backend call.
        assert_eq!(worker.run_once().await.unwrap(), BatchOutcome::default());
        assert_eq!(embedder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_run_once_respects_batch_size() {
        let repo = repo_with(&[("GMV", &[]), ("DAU", &[]), ("ARPU", &[])]).await;
        let embedder = MockEmbedder::new(4);
        let worker = worker(&repo, &embedder, BackfillConfig::default().with_batch_size(2));

        assert_eq!(worker.run_once().await.unwrap().stored, 2);
        assert_eq!(repo.list_pending_embeddings(10).await.unwrap().len(), 1);
        assert_eq!(worker.run_once().await.unwrap().stored, 1);
        assert!(repo.list_pending_embeddings(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_backend_failure_keeps_rows_pending() {
        let repo = repo_with(&[("GMV", &[])]).await;
        let embedder = MockEmbedder::new(4).failing();
        let worker = worker(&repo, &embedder, BackfillConfig::default());

        let err = worker.run_once().await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(repo.list_pending_embeddings(10).await.unwrap().len(), 1);

        embedder.set_failing(false);
        assert_eq!(worker.run_once().await.unwrap().stored, 1);
    }

    #[tokio::test]
    async fn test_refused_row_does_not_block_the_queue() {
        let repo = repo_with(&[("GMV", &[]), ("DAU", &[]), ("ARPU", &[])]).await;
        let embedder = MockEmbedder::new(4).rejecting("DAU: DAU definition");
        let worker = worker(&repo, &embedder, BackfillConfig::default().with_batch_size(2));

        let first = worker.run_once().await.unwrap();
        assert_eq!((first.stored, first.rejected), (1, 1));

        // The refused row is set aside, so ARPU gets its turn.
        let second = worker.run_once().await.unwrap();
        assert_eq!((second.pending, second.stored, second.rejected), (1, 1, 0));

        let pending = repo.list_pending_embeddings(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].word, "DAU");

        let calls = embedder.call_count();
        assert_eq!(worker.run_once().await.unwrap(), BatchOutcome::default());
        assert_eq!(embedder.call_count(), calls);
    }

    #[tokio::test]
    async fn test_backend_down_sets_nothing_aside() {
        let repo = repo_with(&[("GMV", &[]), ("DAU", &[])]).await;
        let embedder = MockEmbedder::new(4).failing();
        let worker = worker(&repo, &embedder, BackfillConfig::default());

        assert!(matches!(worker.run_once().await, Err(Error::Embedding(_))));
        // One batch call plus one call per row.
        assert_eq!(embedder.call_count(), 3);

        embedder.set_failing(false);
        assert_eq!(worker.run_once().await.unwrap().stored, 2);
    }

    #[tokio::test]
    async fn test_worker_loop_recovers_and_stops() {
        let repo = repo_with(&[("GMV", &["gross merchandise value"])]).await;
        let embedder = MockEmbedder::new(4).failing();
        let worker = worker(
            &repo,
            &embedder,
            BackfillConfig::default().with_poll_interval(10),
        );
        let mut events = worker.events();
        let handle = worker.start();

        let wait = Duration::from_secs(5);
        assert_eq!(
            tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap(),
            BackfillEvent::WorkerStarted
        );
        assert!(matches!(
            tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap(),
            BackfillEvent::BatchFailed { .. }
        ));

        embedder.set_failing(false);
        loop {
            let event = tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap();
            if let BackfillEvent::BatchStored { stored, skipped } = event {
                assert_eq!((stored, skipped), (2, 0));
                break;
            }
        }
        assert!(repo.list_pending_embeddings(10).await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        loop {
            let event = tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap();
            if event == BackfillEvent::WorkerStopped {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_disabled_worker_does_nothing() {
        let repo = repo_with(&[("GMV", &[])]).await;
        let embedder = MockEmbedder::new(4);
        let worker = worker(&repo, &embedder, BackfillConfig::default().with_enabled(false));
        let mut events = worker.events();
        let _handle = worker.start();

        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(embedder.call_count(), 0);
        assert_eq!(repo.list_pending_embeddings(10).await.unwrap().len(), 1);
    }
}
