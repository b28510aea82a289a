//! Query engine: embed → retrieve → ground → generate.
//!
//! Retrieval is scoped to one user's index. When nothing is retrieved the
//! engine returns [`NO_DOCUMENTS_ANSWER`] without calling the generator.
//! Otherwise the top chunks become numbered `[Source N]` context blocks in a
//! prompt that instructs the model to answer only from them.
//!
//! Embedding errors are surfaced unchanged; generation errors are surfaced
//! and never replaced with a made-up answer.
//!
//! Every retrieved document is checked against the store before it is
//! cited. A document that is no longer `PROCESSED` there (deleted by another
//! process sharing the database) is evicted from the index and the search
//! is repeated.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{EmbedError, QueryError};
use crate::generation::{GroundedPrompt, Generator};
use crate::index::{SearchHit, VectorIndex};
use crate::models::DocumentStatus;
use crate::store::DocumentStore;

pub const NO_DOCUMENTS_ANSWER: &str = "I don't have any documents in your Knowledge Vault yet. \
     Please upload some travel guides or notes first!";

const SYSTEM_PROMPT: &str = "You are a helpful travel assistant. Answer the user's question \
based on the provided context from their uploaded documents.

IMPORTANT:
- Only use information from the provided sources
- If the context doesn't contain the answer, say so clearly
- Cite sources using [Source N] format when referencing information
- Be concise but comprehensive";

/// A reference to one retrieved chunk, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// 1-based `[Source N]` number used in the prompt.
    pub source: usize,
    pub title: String,
    pub document_id: String,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub title: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub relevance_score: f32,
}

impl From<SearchHit> for RetrievedChunk {
    fn from(hit: SearchHit) -> Self {
        Self {
            text: hit.text,
            title: hit.title,
            document_id: hit.document_id,
            chunk_index: hit.ordinal,
            relevance_score: hit.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub chunks: Vec<RetrievedChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
}

impl QueryAnswer {
    fn no_documents() -> Self {
        Self {
            answer: NO_DOCUMENTS_ANSWER.to_string(),
            citations: Vec::new(),
            chunks: Vec::new(),
            tokens_used: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub embed_timeout: Duration,
    pub generation_timeout: Duration,
}

impl QuerySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_top_k: config.query.default_top_k,
            max_top_k: config.query.max_top_k,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
        }
    }

    /// Requested `top_k`, or the default, clamped to `[1, max_top_k]`.
    pub fn resolve_top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_top_k)
            .clamp(1, self.max_top_k.max(1))
    }
}

/// Build the two-message prompt from ranked chunks.
pub fn build_prompt(query: &str, chunks: &[RetrievedChunk]) -> GroundedPrompt {
    let context = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[Source {}] {}", i + 1, c.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    GroundedPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "Context from user's documents:\n{}\n\nUser's question: {}\n\n\
             Answer the question based on the context above. Include [Source N] citations.",
            context, query
        ),
    }
}

pub struct QueryEngine {
    store: Arc<dyn DocumentStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn Generator>,
    settings: QuerySettings,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn Generator>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// The `top_k` nearest chunks for the user, nearest first.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        let vector = match tokio::time::timeout(
            self.settings.embed_timeout,
            embed_query(self.embedder.as_ref(), query),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EmbedError::Unavailable(format!(
                    "query embedding timed out after {}ms",
                    self.settings.embed_timeout.as_millis()
                ))
                .into())
            }
        };
        let hits = self.live_hits(user_id, &vector, top_k).await?;
        Ok(hits.into_iter().map(RetrievedChunk::from).collect())
    }

    /// Top-k search restricted to documents the store still holds as
    /// `PROCESSED`. Stale documents are evicted from the index.
    async fn live_hits(
        &self,
        user_id: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>, QueryError> {
        loop {
            let hits = self.index.query(user_id, vector, top_k).await;
            let mut checked = HashSet::new();
            let mut stale = Vec::new();
            for hit in &hits {
                if !checked.insert(hit.document_id.as_str()) {
                    continue;
                }
                let live = self
                    .store
                    .get(user_id, &hit.document_id)
                    .await?
                    .is_some_and(|doc| doc.status == DocumentStatus::Processed);
                if !live {
                    stale.push(hit.document_id.clone());
                }
            }
            if stale.is_empty() {
                return Ok(hits);
            }
            for document_id in &stale {
                let removed = self.index.remove(user_id, document_id).await;
                warn!(
                    user_id,
                    document_id = %document_id,
                    removed,
                    "evicted index entries of a document missing from the store"
                );
            }
        }
    }

    pub async fn answer(
        &self,
        user_id: &str,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<QueryAnswer, QueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::InvalidQuery("query must not be empty".to_string()));
        }
        let top_k = self.settings.resolve_top_k(top_k);
        debug!(user_id, top_k, query, "query received");

        // An empty index answers without spending an embedding call.
        if self.index.len(user_id).await == 0 {
            info!(user_id, "query against empty vault");
            return Ok(QueryAnswer::no_documents());
        }

        let chunks = self.retrieve(user_id, query, top_k).await?;
        if chunks.is_empty() {
            info!(user_id, "no chunks retrieved");
            return Ok(QueryAnswer::no_documents());
        }

        let prompt = build_prompt(query, &chunks);
        let generation = match tokio::time::timeout(
            self.settings.generation_timeout,
            self.generator.generate(&prompt),
        )
        .await
        {
            Ok(result) => result.map_err(|e| {
                warn!(user_id, error = %e, "generation failed");
                QueryError::from(e)
            })?,
            Err(_) => {
                warn!(user_id, "generation timed out");
                return Err(QueryError::Timeout(format!(
                    "generation did not finish within {}s",
                    self.settings.generation_timeout.as_secs()
                )));
            }
        };

        let citations = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| Citation {
                source: i + 1,
                title: c.title.clone(),
                document_id: c.document_id.clone(),
                chunk_index: c.chunk_index,
            })
            .collect();

        info!(
            user_id,
            chunk_count = chunks.len(),
            tokens_used = generation.tokens_used,
            model = self.generator.model_name(),
            "query answered"
        );
        Ok(QueryAnswer {
            answer: generation.text,
            citations,
            chunks,
            tokens_used: generation.tokens_used,
        })
    }
}
