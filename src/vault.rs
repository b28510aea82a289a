//! The vault facade: one handle over store, index, pipeline and engine.
//!
//! [`Vault::open`] wires the SQLite store and the configured providers, then
//! runs startup recovery:
//!
//! 1. Documents left `PROCESSING` by a previous process become `FAILED`
//!    with stage `interrupted`.
//! 2. Chunks of every `PROCESSED` document are reloaded into the per-user
//!    vector indexes, one batch per document.
//!
//! A document whose stored vectors no longer fit the index (the embedding
//! dimensionality changed) cannot be served. [`Vault::open`] refuses to start
//! while any exist; [`Vault::attach`] skips step 1 and only warns, so the CLI
//! can still delete them or run next to a live server.
//!
//! Deletion takes the user's index write guard, removes the record and its
//! chunk rows, then removes the index entries, so a concurrent query never
//! cites a document that no longer exists.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::VaultError;
use crate::generation::{create_generator, Generator};
use crate::index::{IndexEntry, VectorIndex};
use crate::ingest::{IngestPipeline, IngestSettings};
use crate::models::{Document, FailureReason, FailureStage, Upload};
use crate::query::{QueryAnswer, QueryEngine, QuerySettings};
use crate::store::{DocumentStore, IndexedChunk, SqliteDocumentStore};
use crate::{db, migrate};

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: u64,
    pub documents: usize,
    pub chunks: usize,
    /// `PROCESSED` documents whose chunks the index rejected.
    pub unloadable: Vec<String>,
}

pub struct Vault {
    store: Arc<dyn DocumentStore>,
    index: Arc<VectorIndex>,
    pipeline: IngestPipeline,
    engine: QueryEngine,
    background: bool,
}

impl Vault {
    /// Assemble a vault from explicit parts. No recovery is run.
    pub fn new(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let index = Arc::new(VectorIndex::new(config.index.metric));
        let pipeline = IngestPipeline::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            IngestSettings::from_config(config),
        );
        let engine = QueryEngine::new(
            store.clone(),
            index.clone(),
            embedder,
            generator,
            QuerySettings::from_config(config),
        );
        Self {
            store,
            index,
            pipeline,
            engine,
            background: config.ingest.background,
        }
    }

    /// Open the configured database and providers, then recover.
    ///
    /// Only the process that owns ingestion (the server) should call this;
    /// anything else should [`attach`](Self::attach).
    pub async fn open(config: &Config) -> Result<Self> {
        let vault = Self::connect(config).await?;
        let report = vault.recover().await?;
        if !report.unloadable.is_empty() {
            bail!(
                "{} processed document(s) do not match the vector index ({}); \
                 restore the previous [embedding] settings or delete them with `vault delete`",
                report.unloadable.len(),
                report.unloadable.join(", ")
            );
        }
        info!(
            interrupted = report.interrupted,
            documents = report.documents,
            chunks = report.chunks,
            "vault opened"
        );
        Ok(vault)
    }

    /// Open the vault and reload the index without touching document
    /// states, so a server running against the same database keeps its
    /// in-flight documents.
    pub async fn attach(config: &Config) -> Result<Self> {
        let vault = Self::connect(config).await?;
        let report = vault.reload_index().await?;
        if !report.unloadable.is_empty() {
            warn!(
                documents = %report.unloadable.join(", "),
                "processed documents could not be loaded into the index"
            );
        }
        debug!(
            documents = report.documents,
            chunks = report.chunks,
            "vault attached"
        );
        Ok(vault)
    }

    async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool));
        let embedder = create_provider(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Ok(Self::new(config, store, embedder, generator))
    }

    /// Fail interrupted documents, then reload the index.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let reason = FailureReason::new(
            FailureStage::Interrupted,
            "processing was interrupted by a restart; please upload the file again",
        );
        let interrupted = self.store.fail_interrupted(&reason).await?;
        if interrupted > 0 {
            warn!(count = interrupted, "marked interrupted documents as failed");
        }
        let report = self.reload_index().await?;
        Ok(RecoveryReport {
            interrupted,
            ..report
        })
    }

    /// Load the chunks of every `PROCESSED` document into the index.
    pub async fn reload_index(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for (user_id, batch) in group_by_document(self.store.indexed_chunks().await?) {
            let count = batch.len();
            let document_id = batch
                .first()
                .map(|e| e.document_id.clone())
                .unwrap_or_default();
            match self.index.insert(&user_id, batch).await {
                Ok(()) => {
                    report.documents += 1;
                    report.chunks += count;
                }
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        document_id = %document_id,
                        error = %e,
                        "could not reload document into index"
                    );
                    report.unloadable.push(document_id);
                }
            }
        }
        Ok(report)
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    /// Accept an upload. In background mode the record comes back
    /// `PROCESSING`; inline it comes back in its terminal state.
    pub async fn upload(&self, upload: Upload) -> Result<Document, VaultError> {
        if self.background {
            self.pipeline.submit(upload).await
        } else {
            self.pipeline.ingest(upload).await
        }
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Document>, VaultError> {
        require_user(user_id)?;
        Ok(self.store.list(user_id).await?)
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Result<Document, VaultError> {
        require_user(user_id)?;
        self.store
            .get(user_id, id)
            .await?
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<(), VaultError> {
        require_user(user_id)?;
        let user_index = self.index.user_index(user_id).await;
        let mut shard = user_index.write().await;
        if !self.store.delete(user_id, id).await? {
            return Err(VaultError::NotFound(id.to_string()));
        }
        let removed = shard.remove_document(id);
        info!(user_id, document_id = id, chunks_removed = removed, "document deleted");
        Ok(())
    }

    pub async fn query(
        &self,
        user_id: &str,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<QueryAnswer, VaultError> {
        require_user(user_id)?;
        Ok(self.engine.answer(user_id, query, top_k).await?)
    }
}

fn require_user(user_id: &str) -> Result<(), VaultError> {
    if user_id.trim().is_empty() {
        return Err(VaultError::BadRequest("missing user identity".to_string()));
    }
    Ok(())
}

/// Group stored chunks into one index batch per document, preserving order.
fn group_by_document(chunks: Vec<IndexedChunk>) -> Vec<(String, Vec<IndexEntry>)> {
    let mut groups: Vec<(String, Vec<IndexEntry>)> = Vec::new();
    for IndexedChunk {
        user_id,
        title,
        chunk,
    } in chunks
    {
        let entry = IndexEntry {
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            title,
            text: chunk.text,
            ordinal: chunk.ordinal,
            vector: chunk.embedding,
        };
        let continues_last = groups.last().is_some_and(|(owner, batch)| {
            *owner == user_id
                && batch
                    .first()
                    .is_some_and(|e| e.document_id == entry.document_id)
        });
        if continues_last {
            if let Some((_, batch)) = groups.last_mut() {
                batch.push(entry);
                continue;
            }
        }
        groups.push((user_id, vec![entry]));
    }
    groups
}
