//! In-memory [`DocumentStore`] for tests and library use.
//!
//! Records live in a `Vec` (creation order) behind a `tokio::sync::RwLock`;
//! chunk rows are keyed by document id together with the commit sequence
//! number that orders index reloads.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{Chunk, Document, DocumentStatus, FailureReason};

use super::{DocumentStore, IndexedChunk};

#[derive(Default)]
struct Inner {
    docs: Vec<Document>,
    chunks: HashMap<String, (u64, Vec<Chunk>)>,
    last_commit: u64,
}

impl Inner {
    /// The user's document, if the state machine lets it move to `next`.
    fn transition_mut(
        &mut self,
        user_id: &str,
        id: &str,
        next: DocumentStatus,
    ) -> Option<&mut Document> {
        self.docs.iter_mut().find(|d| {
            d.id == id && d.user_id == user_id && d.status.can_transition_to(next)
        })
    }
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<Inner>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, doc: &Document) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.docs.iter().any(|d| d.id == doc.id) {
            anyhow::bail!("document {} already exists", doc.id);
        }
        inner.docs.push(doc.clone());
        Ok(())
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Option<Document>> {
        let inner = self.inner.read().await;
        Ok(inner
            .docs
            .iter()
            .find(|d| d.id == id && d.user_id == user_id)
            .cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<Document> = inner
            .docs
            .iter()
            .rev()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        // Stable sort keeps reverse creation order among equal timestamps.
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn complete(
        &self,
        user_id: &str,
        id: &str,
        chunks: &[Chunk],
        token_estimate: usize,
    ) -> Result<Option<Document>> {
        let mut inner = self.inner.write().await;
        let updated = match inner.transition_mut(user_id, id, DocumentStatus::Processed) {
            Some(doc) => {
                doc.status = DocumentStatus::Processed;
                doc.chunk_count = chunks.len();
                doc.token_estimate = token_estimate;
                doc.clone()
            }
            None => return Ok(None),
        };
        inner.last_commit += 1;
        let seq = inner.last_commit;
        inner.chunks.insert(id.to_string(), (seq, chunks.to_vec()));
        Ok(Some(updated))
    }

    async fn fail(
        &self,
        user_id: &str,
        id: &str,
        reason: &FailureReason,
    ) -> Result<Option<Document>> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .transition_mut(user_id, id, DocumentStatus::Failed)
            .map(|doc| {
                doc.status = DocumentStatus::Failed;
                doc.failure = Some(reason.clone());
                doc.clone()
            }))
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.docs.len();
        inner.docs.retain(|d| !(d.id == id && d.user_id == user_id));
        let removed = inner.docs.len() < before;
        if removed {
            inner.chunks.remove(id);
        }
        Ok(removed)
    }

    async fn fail_interrupted(&self, reason: &FailureReason) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for doc in inner
            .docs
            .iter_mut()
            .filter(|d| d.status.can_transition_to(DocumentStatus::Failed))
        {
            doc.status = DocumentStatus::Failed;
            doc.failure = Some(reason.clone());
            count += 1;
        }
        Ok(count)
    }

    async fn indexed_chunks(&self) -> Result<Vec<IndexedChunk>> {
        let inner = self.inner.read().await;
        let mut committed: Vec<(u64, &Document, &Vec<Chunk>)> = inner
            .docs
            .iter()
            .filter(|d| d.status == DocumentStatus::Processed)
            .filter_map(|d| inner.chunks.get(&d.id).map(|(seq, chunks)| (*seq, d, chunks)))
            .collect();
        committed.sort_by_key(|(seq, _, _)| *seq);

        let mut out = Vec::new();
        for (_, doc, chunks) in committed {
            let mut chunks = chunks.clone();
            chunks.sort_by_key(|c| c.ordinal);
            out.extend(chunks.into_iter().map(|chunk| IndexedChunk {
                user_id: doc.user_id.clone(),
                title: doc.title.clone(),
                chunk,
            }));
        }
        Ok(out)
    }
}
