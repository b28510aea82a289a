//! Document Store abstraction.
//!
//! The [`DocumentStore`] trait holds document records, their lifecycle
//! status, and the persisted chunk rows (text plus embedding) of processed
//! documents. Two backends exist:
//!
//! - [`memory::InMemoryDocumentStore`]: for tests and library embedding.
//! - [`sqlite::SqliteDocumentStore`]: durable storage via sqlx.
//!
//! Status transitions are enforced here: [`complete`](DocumentStore::complete)
//! and [`fail`](DocumentStore::fail) only act on a document that is still
//! `PROCESSING`, and report `None` otherwise (for example when the user
//! deleted the document while it was being processed).

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Document, FailureReason};

pub use memory::InMemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

/// A persisted chunk of a `PROCESSED` document, with the owner and title
/// needed to rebuild the vector index at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub user_id: String,
    pub title: String,
    pub chunk: Chunk,
}

/// Abstract storage backend for document records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create`](DocumentStore::create) | Insert a new `PROCESSING` record |
/// | [`get`](DocumentStore::get) | Fetch one record owned by a user |
/// | [`list`](DocumentStore::list) | All of a user's records, newest first |
/// | [`complete`](DocumentStore::complete) | Persist chunks and move to `PROCESSED` |
/// | [`fail`](DocumentStore::fail) | Move to `FAILED` with a reason |
/// | [`delete`](DocumentStore::delete) | Remove a record and its chunks |
/// | [`fail_interrupted`](DocumentStore::fail_interrupted) | Startup recovery |
/// | [`indexed_chunks`](DocumentStore::indexed_chunks) | Chunks to reload into the index |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create(&self, doc: &Document) -> Result<()>;

    /// The record, if it exists and belongs to `user_id`.
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<Document>>;

    /// Newest first; ties keep the later-created record first.
    async fn list(&self, user_id: &str) -> Result<Vec<Document>>;

    /// Atomically store the chunk rows and transition to `PROCESSED`.
    ///
    /// Returns `None` without writing anything when no `PROCESSING`
    /// document with this id exists for the user.
    async fn complete(
        &self,
        user_id: &str,
        id: &str,
        chunks: &[Chunk],
        token_estimate: usize,
    ) -> Result<Option<Document>>;

    /// Transition a `PROCESSING` document to `FAILED`.
    async fn fail(
        &self,
        user_id: &str,
        id: &str,
        reason: &FailureReason,
    ) -> Result<Option<Document>>;

    /// Delete the record and its chunk rows. Returns whether it existed.
    async fn delete(&self, user_id: &str, id: &str) -> Result<bool>;

    /// Fail every document still marked `PROCESSING`. Returns the count.
    async fn fail_interrupted(&self, reason: &FailureReason) -> Result<u64>;

    /// Chunks of every `PROCESSED` document, in document creation order and
    /// then ordinal order.
    async fn indexed_chunks(&self) -> Result<Vec<IndexedChunk>>;
}
