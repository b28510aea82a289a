//! Ingestion pipeline orchestration.
//!
//! Drives one upload through extract → chunk → embed → commit, moving its
//! document record through the lifecycle state machine:
//!
//! ```text
//! accept ──▶ PROCESSING ──extract──chunk──embed──commit──▶ PROCESSED
//!                 │           │               │        │
//!                 └───────────┴───────────────┴────────┴──▶ FAILED (stage, message)
//! ```
//!
//! Nothing is written to the vector index or the chunk table before the
//! commit step. The commit holds the user's index write guard while it
//! persists the chunk rows with the `PROCESSED` transition and then applies
//! the batch to the index, so concurrent queries for the user observe either
//! none or all of the document's chunks.
//!
//! Transient embedding failures (`EmbeddingUnavailable`, including timeouts)
//! are retried with exponential backoff. Store write failures at commit time
//! are retried the same way as `IndexWriteFailed`; the guard is released
//! before each backoff and the batch is re-validated when it is re-acquired.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{check_batch, EmbeddingProvider};
use crate::error::{EmbedError, ExtractError, IndexError, VaultError};
use crate::extract::{extract_text, FileKind};
use crate::index::{IndexEntry, VectorIndex};
use crate::models::{Chunk, Document, DocumentStatus, FailureReason, FailureStage, Upload};
use crate::store::DocumentStore;

/// Tunables for the pipeline, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
    /// Texts per embedding call.
    pub batch_size: usize,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub embed_timeout: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_tokens: config.chunking.chunk_tokens,
            overlap_tokens: config.chunking.overlap_tokens,
            batch_size: config.embedding.batch_size,
            max_retries: config.embedding.max_retries,
            retry_backoff: Duration::from_millis(config.embedding.retry_backoff_ms),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based): `backoff * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exponent)
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from_config(&Config::with_db_path("vault.sqlite"))
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn DocumentStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: IngestSettings,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Create the document record in `PROCESSING`.
    pub async fn accept(&self, upload: &Upload) -> Result<Document, VaultError> {
        if upload.user_id.trim().is_empty() {
            return Err(VaultError::BadRequest("missing user identity".to_string()));
        }
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            user_id: upload.user_id.clone(),
            title: upload.resolved_title(),
            filename: upload.resolved_filename(),
            notes: upload.notes.clone(),
            content_type: upload.content_type.clone(),
            status: DocumentStatus::Processing,
            failure: None,
            chunk_count: 0,
            token_estimate: 0,
            created_at: Utc::now(),
        };
        self.store.create(&doc).await?;
        info!(
            user_id = %doc.user_id,
            document_id = %doc.id,
            filename = %doc.filename,
            bytes = upload.bytes.len(),
            "document accepted"
        );
        Ok(doc)
    }

    /// Accept the upload and process it on a spawned task. Returns the
    /// `PROCESSING` record immediately.
    ///
    /// The worker runs under a supervisor task: if it panics or cannot record
    /// its outcome, the supervisor makes one more attempt to move the
    /// document to `FAILED` so it does not sit in `PROCESSING` until restart.
    pub async fn submit(&self, upload: Upload) -> Result<Document, VaultError> {
        let doc = self.accept(&upload).await?;
        let pipeline = self.clone();
        let accepted = doc.clone();
        tokio::spawn(async move {
            let worker = pipeline.clone();
            let worker_doc = accepted.clone();
            let outcome =
                tokio::spawn(async move { worker.process(&worker_doc, upload).await }).await;
            let message = match outcome {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => format!("processing aborted: {:#}", e),
                Err(e) => format!("processing task crashed: {}", e),
            };
            error!(document_id = %accepted.id, error = %message, "ingestion aborted");
            pipeline.abandon(&accepted, message).await;
        });
        Ok(doc)
    }

    /// Best-effort transition to `FAILED` after the worker died.
    async fn abandon(&self, doc: &Document, message: String) {
        let reason = FailureReason::new(FailureStage::Interrupted, message);
        if let Err(e) = self.store.fail(&doc.user_id, &doc.id, &reason).await {
            error!(
                document_id = %doc.id,
                error = %e,
                "could not record failure; document stays PROCESSING until restart"
            );
        }
    }

    /// Accept and process inline. Returns the record in its terminal state.
    pub async fn ingest(&self, upload: Upload) -> Result<Document, VaultError> {
        let doc = self.accept(&upload).await?;
        match self.process(&doc, upload).await? {
            Some(done) => Ok(done),
            None => Err(VaultError::NotFound(doc.id)),
        }
    }

    /// Run the pipeline for an accepted document.
    ///
    /// Returns the terminal record, or `None` if the document was deleted
    /// while it was being processed. `Err` is reserved for store failures
    /// that prevented recording any outcome.
    pub async fn process(
        &self,
        doc: &Document,
        upload: Upload,
    ) -> anyhow::Result<Option<Document>> {
        let text = match extract(upload).await {
            Ok(text) => text,
            Err(e) => return self.mark_failed(doc, FailureStage::Extraction, e.to_string()).await,
        };

        let mut chunks = chunk_text(
            &doc.id,
            &text,
            self.settings.chunk_tokens,
            self.settings.overlap_tokens,
        );
        debug!(document_id = %doc.id, chunk_count = chunks.len(), "document chunked");

        if let Err(e) = self.embed_chunks(doc, &mut chunks).await {
            return self.mark_failed(doc, FailureStage::Embedding, e.to_string()).await;
        }

        self.commit(doc, chunks).await
    }

    async fn embed_chunks(&self, doc: &Document, chunks: &mut [Chunk]) -> Result<(), EmbedError> {
        let dims = self.embedder.dims();
        for batch in chunks.chunks_mut(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embed_with_retry(doc, &texts).await?;
            check_batch(dims, texts.len(), &vectors)?;
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.embedding = vector;
            }
        }
        Ok(())
    }

    async fn embed_with_retry(
        &self,
        doc: &Document,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.settings.embed_timeout, self.embedder.embed(texts))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EmbedError::Unavailable(format!(
                        "embedding timed out after {}ms",
                        self.settings.embed_timeout.as_millis()
                    ))),
                };
            match result {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt <= self.settings.max_retries => {
                    let delay = self.settings.backoff_for(attempt);
                    warn!(
                        document_id = %doc.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit(&self, doc: &Document, chunks: Vec<Chunk>) -> anyhow::Result<Option<Document>> {
        let token_estimate: usize = chunks.iter().map(|c| c.token_count).sum();
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .map(|c| IndexEntry {
                chunk_id: c.id.clone(),
                document_id: doc.id.clone(),
                title: doc.title.clone(),
                text: c.text.clone(),
                ordinal: c.ordinal,
                vector: c.embedding.clone(),
            })
            .collect();

        let user_index = self.index.user_index(&doc.user_id).await;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // Held for one store write and the apply, never across a backoff.
            let mut shard = user_index.write().await;
            if let Err(e) = shard.validate(&entries) {
                drop(shard);
                return self.mark_failed(doc, FailureStage::Index, e.to_string()).await;
            }

            match self
                .store
                .complete(&doc.user_id, &doc.id, &chunks, token_estimate)
                .await
            {
                Ok(Some(done)) => {
                    shard.apply(entries);
                    info!(
                        user_id = %done.user_id,
                        document_id = %done.id,
                        chunk_count = done.chunk_count,
                        token_estimate = done.token_estimate,
                        attempt,
                        "document processed"
                    );
                    return Ok(Some(done));
                }
                Ok(None) => {
                    info!(document_id = %doc.id, "document removed during processing, discarding chunks");
                    return Ok(None);
                }
                Err(e) => {
                    drop(shard);
                    let err = IndexError::WriteFailed(e.to_string());
                    if attempt > self.settings.max_retries {
                        return self.mark_failed(doc, FailureStage::Index, err.to_string()).await;
                    }
                    let delay = self.settings.backoff_for(attempt);
                    warn!(
                        document_id = %doc.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn mark_failed(
        &self,
        doc: &Document,
        stage: FailureStage,
        message: String,
    ) -> anyhow::Result<Option<Document>> {
        warn!(
            user_id = %doc.user_id,
            document_id = %doc.id,
            stage = stage.as_str(),
            reason = %message,
            "document failed"
        );
        self.store
            .fail(&doc.user_id, &doc.id, &FailureReason::new(stage, message))
            .await
    }
}

/// Detect the format and extract text on the blocking pool. A panic inside a
/// parser is reported as `ExtractionFailed`.
async fn extract(upload: Upload) -> Result<String, ExtractError> {
    let kind = FileKind::detect(upload.content_type.as_deref(), upload.filename.as_deref())?;
    let bytes = upload.bytes;
    tokio::task::spawn_blocking(move || extract_text(&bytes, kind))
        .await
        .map_err(|e| ExtractError::ExtractionFailed(format!("parser crashed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::index::Metric;
    use crate::store::InMemoryDocumentStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hash embeddings behind a scripted sequence of failures.
    struct ScriptedEmbedder {
        inner: HashProvider,
        failures: Mutex<Vec<EmbedError>>,
        delay: Duration,
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedEmbedder {
        fn new(failures: Vec<EmbedError>) -> Self {
            Self {
                inner: HashProvider::new(32),
                failures: Mutex::new(failures),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedEmbedder {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            32
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(texts.len());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next_failure = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next_failure {
                Some(e) => Err(e),
                None => self.inner.embed(texts).await,
            }
        }
    }

    /// Returns vectors of the wrong width.
    struct NarrowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for NarrowEmbedder {
        fn model_name(&self) -> &str {
            "narrow"
        }
        fn dims(&self) -> usize {
            32
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|_| vec![1.0; 8]).collect())
        }
    }

    /// In-memory store whose `complete` fails a fixed number of times.
    struct FlakyStore {
        inner: InMemoryDocumentStore,
        failures_left: AtomicUsize,
        complete_calls: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(times: usize) -> Self {
            Self {
                inner: InMemoryDocumentStore::new(),
                failures_left: AtomicUsize::new(times),
                complete_calls: AtomicUsize::new(0),
            }
        }

        fn complete_calls(&self) -> usize {
            self.complete_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn create(&self, doc: &Document) -> anyhow::Result<()> {
            self.inner.create(doc).await
        }
        async fn get(&self, user_id: &str, id: &str) -> anyhow::Result<Option<Document>> {
            self.inner.get(user_id, id).await
        }
        async fn list(&self, user_id: &str) -> anyhow::Result<Vec<Document>> {
            self.inner.list(user_id).await
        }
        async fn complete(
            &self,
            user_id: &str,
            id: &str,
            chunks: &[Chunk],
            token_estimate: usize,
        ) -> anyhow::Result<Option<Document>> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                anyhow::bail!("database is locked");
            }
            self.inner.complete(user_id, id, chunks, token_estimate).await
        }
        async fn fail(
            &self,
            user_id: &str,
            id: &str,
            reason: &FailureReason,
        ) -> anyhow::Result<Option<Document>> {
            self.inner.fail(user_id, id, reason).await
        }
        async fn delete(&self, user_id: &str, id: &str) -> anyhow::Result<bool> {
            self.inner.delete(user_id, id).await
        }
        async fn fail_interrupted(&self, reason: &FailureReason) -> anyhow::Result<u64> {
            self.inner.fail_interrupted(reason).await
        }
        async fn indexed_chunks(&self) -> anyhow::Result<Vec<crate::store::IndexedChunk>> {
            self.inner.indexed_chunks().await
        }
    }

    /// Panics inside the worker task.
    struct PanickingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PanickingEmbedder {
        fn model_name(&self) -> &str {
            "panicking"
        }
        fn dims(&self) -> usize {
            32
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            panic!("tokenizer exploded");
        }
    }

    fn flaky_pipeline(
        store: Arc<FlakyStore>,
        settings: IngestSettings,
    ) -> (IngestPipeline, Arc<VectorIndex>) {
        let index = Arc::new(VectorIndex::new(Metric::Cosine));
        let pipeline = IngestPipeline::new(
            store,
            index.clone(),
            Arc::new(HashProvider::new(32)),
            settings,
        );
        (pipeline, index)
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            chunk_tokens: 20,
            overlap_tokens: 5,
            batch_size: 64,
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            embed_timeout: Duration::from_secs(5),
        }
    }

    fn pipeline_with(
        embedder: Arc<dyn EmbeddingProvider>,
        settings: IngestSettings,
    ) -> (IngestPipeline, Arc<InMemoryDocumentStore>, Arc<VectorIndex>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let index = Arc::new(VectorIndex::new(Metric::Cosine));
        let pipeline = IngestPipeline::new(store.clone(), index.clone(), embedder, settings);
        (pipeline, store, index)
    }

    fn text_upload(user: &str, text: &str) -> Upload {
        Upload {
            user_id: user.to_string(),
            filename: Some("lisbon.txt".to_string()),
            content_type: Some("text/plain".to_string()),
            title: None,
            notes: Some("weekend trip".to_string()),
            bytes: text.as_bytes().to_vec(),
        }
    }

    fn long_text() -> String {
        (0..30)
            .map(|i| format!("Day {} in Lisbon starts with coffee near the river.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[tokio::test]
    async fn processes_text_into_indexed_chunks() {
        let (pipeline, _store, index) =
            pipeline_with(Arc::new(HashProvider::new(32)), settings());
        let doc = pipeline
            .ingest(text_upload("alice", &long_text()))
            .await
            .unwrap();

        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(doc.title, "lisbon");
        assert_eq!(doc.notes.as_deref(), Some("weekend trip"));
        assert!(doc.chunk_count > 1);
        assert_eq!(index.document_len("alice", &doc.id).await, doc.chunk_count);
        assert!(doc.token_estimate >= long_text().len() / 4);
    }

    #[tokio::test]
    async fn unsupported_format_fails_at_extraction() {
        let (pipeline, _store, index) =
            pipeline_with(Arc::new(HashProvider::new(32)), settings());
        let mut upload = text_upload("alice", "pixels");
        upload.filename = Some("photo.png".to_string());
        upload.content_type = Some("image/png".to_string());

        let doc = pipeline.ingest(upload).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        let failure = doc.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::Extraction);
        assert!(failure.message.contains("unsupported format"));
        assert_eq!(index.len("alice").await, 0);
    }

    #[tokio::test]
    async fn rejected_embedding_fails_without_retry() {
        let embedder = Arc::new(ScriptedEmbedder::new(vec![EmbedError::Rejected(
            "input too long".into(),
        )]));
        let (pipeline, _store, index) = pipeline_with(embedder.clone(), settings());
        let doc = pipeline.ingest(text_upload("alice", "Short note.")).await.unwrap();

        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.failure.unwrap().stage, FailureStage::Embedding);
        assert_eq!(embedder.calls(), 1);
        assert_eq!(index.len("alice").await, 0);
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried() {
        let embedder = Arc::new(ScriptedEmbedder::new(vec![
            EmbedError::Unavailable("429".into()),
            EmbedError::Unavailable("503".into()),
        ]));
        let (pipeline, _store, _index) = pipeline_with(embedder.clone(), settings());
        let doc = pipeline.ingest(text_upload("alice", "Short note.")).await.unwrap();

        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(embedder.calls(), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let embedder = Arc::new(ScriptedEmbedder::new(vec![
            EmbedError::Unavailable("down".into());
            10
        ]));
        let (pipeline, _store, index) = pipeline_with(embedder.clone(), settings());
        let doc = pipeline.ingest(text_upload("alice", "Short note.")).await.unwrap();

        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(embedder.calls(), 3);
        assert_eq!(index.len("alice").await, 0);
    }

    #[tokio::test]
    async fn embedding_timeout_fails_document() {
        let embedder = Arc::new(ScriptedEmbedder::slow(Duration::from_millis(200)));
        let mut settings = settings();
        settings.embed_timeout = Duration::from_millis(10);
        settings.max_retries = 0;
        let (pipeline, _store, _index) = pipeline_with(embedder, settings);

        let doc = pipeline.ingest(text_upload("alice", "Short note.")).await.unwrap();
        let failure = doc.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::Embedding);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn wrong_dimensionality_is_rejected() {
        let (pipeline, _store, index) = pipeline_with(Arc::new(NarrowEmbedder), settings());
        let doc = pipeline.ingest(text_upload("alice", "Short note.")).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.failure.unwrap().stage, FailureStage::Embedding);
        assert_eq!(index.len("alice").await, 0);
    }

    #[tokio::test]
    async fn embeds_in_sub_batches() {
        let embedder = Arc::new(ScriptedEmbedder::new(Vec::new()));
        let mut settings = settings();
        settings.batch_size = 2;
        let (pipeline, _store, _index) = pipeline_with(embedder.clone(), settings);

        let doc = pipeline
            .ingest(text_upload("alice", &long_text()))
            .await
            .unwrap();
        let sizes = embedder.batch_sizes.lock().unwrap().clone();
        assert_eq!(sizes.iter().sum::<usize>(), doc.chunk_count);
        assert!(sizes.iter().all(|&n| n <= 2));
        assert_eq!(sizes.len(), doc.chunk_count.div_ceil(2));
    }

    #[tokio::test]
    async fn deleted_before_commit_leaves_no_entries() {
        let (pipeline, store, index) = pipeline_with(Arc::new(HashProvider::new(32)), settings());
        let upload = text_upload("alice", "Short note.");
        let doc = pipeline.accept(&upload).await.unwrap();
        assert!(store.delete("alice", &doc.id).await.unwrap());

        assert!(pipeline.process(&doc, upload).await.unwrap().is_none());
        assert_eq!(index.len("alice").await, 0);
    }

    #[tokio::test]
    async fn submit_returns_processing_then_completes() {
        let embedder = Arc::new(ScriptedEmbedder::slow(Duration::from_millis(50)));
        let (pipeline, store, _index) = pipeline_with(embedder, settings());
        let doc = pipeline.submit(text_upload("alice", "Short note.")).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);

        let mut status = DocumentStatus::Processing;
        for _ in 0..200 {
            status = store.get("alice", &doc.id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, DocumentStatus::Processed);
    }

    #[tokio::test]
    async fn blank_user_is_bad_request() {
        let (pipeline, _store, _index) = pipeline_with(Arc::new(HashProvider::new(32)), settings());
        let err = pipeline.ingest(text_upload("  ", "x")).await.unwrap_err();
        assert!(matches!(err, VaultError::BadRequest(_)));
    }

    #[tokio::test]
    async fn commit_write_failures_are_retried_as_a_whole_batch() {
        let store = Arc::new(FlakyStore::failing(2));
        let (pipeline, index) = flaky_pipeline(store.clone(), settings());

        let doc = pipeline
            .ingest(text_upload("alice", &long_text()))
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(store.complete_calls(), 3);
        assert_eq!(index.document_len("alice", &doc.id).await, doc.chunk_count);
        assert_eq!(index.len("alice").await, doc.chunk_count);
    }

    #[tokio::test]
    async fn exhausted_commit_retries_fail_at_index_stage() {
        let store = Arc::new(FlakyStore::failing(10));
        let (pipeline, index) = flaky_pipeline(store.clone(), settings());

        let doc = pipeline
            .ingest(text_upload("alice", &long_text()))
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        let failure = doc.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::Index);
        assert!(failure.message.contains("index write failed"));
        assert_eq!(store.complete_calls(), 3);
        assert_eq!(index.len("alice").await, 0);
        assert!(store.indexed_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queries_are_not_blocked_while_commit_backs_off() {
        let store = Arc::new(FlakyStore::failing(2));
        let mut settings = settings();
        settings.retry_backoff = Duration::from_millis(300);
        let (pipeline, index) = flaky_pipeline(store.clone(), settings);

        let existing = HashProvider::new(32).embed_one("Sintra day trip");
        index
            .insert(
                "alice",
                vec![IndexEntry {
                    chunk_id: "c0".to_string(),
                    document_id: "sintra".to_string(),
                    title: "Sintra".to_string(),
                    text: "Sintra day trip".to_string(),
                    ordinal: 0,
                    vector: existing.clone(),
                }],
            )
            .await
            .unwrap();

        let worker = pipeline.clone();
        let ingesting =
            tokio::spawn(async move { worker.ingest(text_upload("alice", "Short note.")).await });

        while store.complete_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let started = std::time::Instant::now();
        let hits = index.query("alice", &existing, 3).await;
        let waited = started.elapsed();
        assert_eq!(hits[0].document_id, "sintra");
        assert!(
            waited < Duration::from_millis(150),
            "query waited {:?} behind a commit backoff",
            waited
        );

        let doc = ingesting.await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(index.len("alice").await, 1 + doc.chunk_count);
    }

    #[tokio::test]
    async fn crashed_worker_marks_document_failed() {
        let (pipeline, store, index) = pipeline_with(Arc::new(PanickingEmbedder), settings());
        let doc = pipeline.submit(text_upload("alice", "Short note.")).await.unwrap();

        let mut current = doc.clone();
        for _ in 0..200 {
            current = store.get("alice", &doc.id).await.unwrap().unwrap();
            if current.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(current.status, DocumentStatus::Failed);
        let failure = current.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::Interrupted);
        assert!(failure.message.contains("crashed"));
        assert_eq!(index.len("alice").await, 0);
    }

    #[test]
    fn backoff_doubles() {
        let mut s = settings();
        s.retry_backoff = Duration::from_millis(100);
        assert_eq!(s.backoff_for(1), Duration::from_millis(100));
        assert_eq!(s.backoff_for(3), Duration::from_millis(400));
    }
}
