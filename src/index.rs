//! Per-user in-memory vector index.
//!
//! Each user owns an independent [`UserIndex`] holding a [`Shard`] of chunk
//! vectors behind a `tokio::sync::RwLock`. There is no global index and no
//! path from one user's shard to another's.
//!
//! # Atomicity
//!
//! A batch is validated in full before the shard is touched, so it is either
//! applied completely or not at all. Writers hold the shard's write guard for
//! the whole apply, and queries hold the read guard for the whole scan, so a
//! query sees either none or all of a document's chunks.
//!
//! The ingestion pipeline takes the write guard itself (via
//! [`UserIndex::write`]) so the document store commit and the index apply
//! happen under the same guard.
//!
//! # Ranking
//!
//! Brute-force scan: distance to every entry, nearest first, ties broken by
//! insertion sequence (earlier wins). Re-inserting a chunk id replaces its
//! vector in place and keeps its original sequence.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::{cosine_similarity, l2_distance};
use crate::error::IndexError;

/// Distance function, fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cosine_similarity`
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
}

impl Metric {
    /// Distance between two vectors. Vectors of different lengths are
    /// infinitely far apart and never returned by a search.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::L2 => l2_distance(a, b),
        }
    }

    /// Relevance score shown to users: higher is better.
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::L2 => 1.0 / (1.0 + distance),
        }
    }
}

/// One chunk vector plus the metadata needed to build a citation.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub ordinal: usize,
    pub vector: Vec<f32>,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub ordinal: usize,
    pub distance: f32,
    pub score: f32,
}

#[derive(Debug)]
struct Stored {
    entry: IndexEntry,
    seq: u64,
}

/// The entries of one user's index.
#[derive(Debug, Default)]
pub struct Shard {
    entries: Vec<Stored>,
    positions: HashMap<String, usize>,
    next_seq: u64,
    dims: Option<usize>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.positions.contains_key(chunk_id)
    }

    /// Number of entries belonging to `document_id`.
    pub fn document_len(&self, document_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|s| s.entry.document_id == document_id)
            .count()
    }

    /// Check a batch without mutating anything.
    pub fn validate(&self, batch: &[IndexEntry]) -> Result<(), IndexError> {
        let expected = match (self.dims, batch.first()) {
            (Some(d), _) => d,
            (None, Some(first)) => first.vector.len(),
            (None, None) => return Ok(()),
        };
        let mut seen = std::collections::HashSet::with_capacity(batch.len());
        for entry in batch {
            if entry.vector.is_empty() || entry.vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: entry.vector.len(),
                });
            }
            if !seen.insert(entry.chunk_id.as_str()) {
                return Err(IndexError::DuplicateChunk(entry.chunk_id.clone()));
            }
        }
        Ok(())
    }

    /// Apply a batch that has already passed [`validate`](Self::validate).
    pub fn apply(&mut self, batch: Vec<IndexEntry>) {
        for entry in batch {
            if self.dims.is_none() {
                self.dims = Some(entry.vector.len());
            }
            match self.positions.get(&entry.chunk_id) {
                Some(&pos) => self.entries[pos].entry = entry,
                None => {
                    self.positions
                        .insert(entry.chunk_id.clone(), self.entries.len());
                    self.entries.push(Stored {
                        entry,
                        seq: self.next_seq,
                    });
                    self.next_seq += 1;
                }
            }
        }
    }

    pub fn insert(&mut self, batch: Vec<IndexEntry>) -> Result<(), IndexError> {
        self.validate(&batch)?;
        self.apply(batch);
        Ok(())
    }

    /// Remove every entry of a document. Returns how many were removed.
    pub fn remove_document(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| s.entry.document_id != document_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.positions = self
                .entries
                .iter()
                .enumerate()
                .map(|(pos, s)| (s.entry.chunk_id.clone(), pos))
                .collect();
        }
        if self.entries.is_empty() {
            self.dims = None;
        }
        removed
    }

    pub fn search(&self, metric: Metric, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(f32, u64, &IndexEntry)> = self
            .entries
            .iter()
            .map(|s| (metric.distance(query, &s.entry.vector), s.seq, &s.entry))
            .filter(|(d, _, _)| d.is_finite())
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(distance, _, e)| SearchHit {
                chunk_id: e.chunk_id.clone(),
                document_id: e.document_id.clone(),
                title: e.title.clone(),
                text: e.text.clone(),
                ordinal: e.ordinal,
                distance,
                score: metric.score(distance),
            })
            .collect()
    }
}

/// One user's index.
#[derive(Debug, Default)]
pub struct UserIndex {
    shard: RwLock<Shard>,
}

impl UserIndex {
    pub async fn read(&self) -> RwLockReadGuard<'_, Shard> {
        self.shard.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Shard> {
        self.shard.write().await
    }
}

/// All users' indexes, created lazily on first write.
pub struct VectorIndex {
    metric: Metric,
    users: RwLock<HashMap<String, Arc<UserIndex>>>,
}

impl VectorIndex {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// The user's index, created if it does not exist yet.
    pub async fn user_index(&self, user_id: &str) -> Arc<UserIndex> {
        if let Some(existing) = self.existing(user_id).await {
            return existing;
        }
        let mut users = self.users.write().await;
        users.entry(user_id.to_string()).or_default().clone()
    }

    /// The user's index if one has been created.
    pub async fn existing(&self, user_id: &str) -> Option<Arc<UserIndex>> {
        self.users.read().await.get(user_id).cloned()
    }

    pub async fn insert(&self, user_id: &str, batch: Vec<IndexEntry>) -> Result<(), IndexError> {
        let index = self.user_index(user_id).await;
        let mut shard = index.write().await;
        shard.insert(batch)
    }

    /// Nearest `k` entries for the user. Empty for unknown users.
    pub async fn query(&self, user_id: &str, vector: &[f32], k: usize) -> Vec<SearchHit> {
        match self.existing(user_id).await {
            Some(index) => index.read().await.search(self.metric, vector, k),
            None => Vec::new(),
        }
    }

    pub async fn remove(&self, user_id: &str, document_id: &str) -> usize {
        match self.existing(user_id).await {
            Some(index) => index.write().await.remove_document(document_id),
            None => 0,
        }
    }

    pub async fn len(&self, user_id: &str) -> usize {
        match self.existing(user_id).await {
            Some(index) => index.read().await.len(),
            None => 0,
        }
    }

    pub async fn document_len(&self, user_id: &str, document_id: &str) -> usize {
        match self.existing(user_id).await {
            Some(index) => index.read().await.document_len(document_id),
            None => 0,
        }
    }
}
