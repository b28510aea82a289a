use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use knowledge_vault::config::Config;
use knowledge_vault::embedding::{EmbeddingProvider, HashProvider};
use knowledge_vault::error::{EmbedError, GenerationError, VaultError};
use knowledge_vault::generation::{Generation, Generator, GroundedPrompt};
use knowledge_vault::migrate;
use knowledge_vault::models::{Chunk, DocumentStatus, FailureStage, Upload};
use knowledge_vault::query::NO_DOCUMENTS_ANSWER;
use knowledge_vault::store::{DocumentStore, InMemoryDocumentStore, SqliteDocumentStore};
use knowledge_vault::vault::Vault;

const DIMS: usize = 64;

/// Answers with the number of sources it was shown.
struct CountingGenerator;

#[async_trait]
impl Generator for CountingGenerator {
    fn model_name(&self) -> &str {
        "counting"
    }
    async fn generate(&self, prompt: &GroundedPrompt) -> Result<Generation, GenerationError> {
        let sources = prompt.user.matches("[Source ").count();
        Ok(Generation {
            text: format!("answered from {} sources", sources),
            tokens_used: Some(42),
        })
    }
}

/// Hash embeddings with a fixed delay per provider call.
struct SlowEmbedder {
    inner: HashProvider,
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        "slow-hash"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

fn test_config() -> Config {
    let mut config = Config::with_db_path("unused.sqlite");
    config.chunking.chunk_tokens = 20;
    config.chunking.overlap_tokens = 4;
    config.embedding.batch_size = 2;
    config.ingest.background = false;
    config
}

fn memory_vault(config: &Config) -> Vault {
    Vault::new(
        config,
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(HashProvider::new(DIMS)),
        Arc::new(CountingGenerator),
    )
}

async fn sqlite_vault(config: &Config) -> Vault {
    let pool = knowledge_vault::db::connect(config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    Vault::new(
        config,
        Arc::new(SqliteDocumentStore::new(pool)),
        Arc::new(HashProvider::new(DIMS)),
        Arc::new(CountingGenerator),
    )
}

fn markdown(user: &str, name: &str, body: &str) -> Upload {
    Upload {
        user_id: user.to_string(),
        filename: Some(name.to_string()),
        content_type: Some("text/markdown".to_string()),
        title: None,
        notes: None,
        bytes: body.as_bytes().to_vec(),
    }
}

fn lisbon_guide() -> String {
    [
        "# Lisbon",
        "Tram 28 climbs from Martim Moniz through Graça and Alfama.",
        "Ride it early in the morning before the queues build up.",
        "Pastéis de nata are best warm, dusted with cinnamon.",
        "The Belém tower is a short train ride west of Cais do Sodré.",
        "Miradouro da Senhora do Monte has the widest view of the city.",
    ]
    .join("\n\n")
}

#[tokio::test]
async fn processed_document_is_fully_indexed_and_retrievable() {
    let config = test_config();
    let vault = memory_vault(&config);

    let doc = vault
        .upload(markdown("alice", "lisbon.md", &lisbon_guide()))
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Processed);
    assert!(doc.chunk_count > 2, "expected several chunks, got {}", doc.chunk_count);
    assert!(doc.token_estimate > 0);
    assert_eq!(
        vault.index().document_len("alice", &doc.id).await,
        doc.chunk_count
    );

    let stored = vault.store().indexed_chunks().await.unwrap();
    assert_eq!(stored.len(), doc.chunk_count);
    let ordinals: Vec<usize> = stored.iter().map(|c| c.chunk.ordinal).collect();
    assert_eq!(ordinals, (0..doc.chunk_count).collect::<Vec<_>>());

    // A chunk's own vector retrieves that chunk first.
    let target = &stored[1].chunk;
    let hits = vault.index().query("alice", &target.embedding, 3).await;
    assert_eq!(hits[0].chunk_id, target.id);
    assert!(hits[0].distance.abs() < 1e-5);
}

#[tokio::test]
async fn empty_vault_returns_fixed_answer() {
    let vault = memory_vault(&test_config());
    let answer = vault.query("nobody", "where should I eat?", None).await.unwrap();
    assert_eq!(answer.answer, NO_DOCUMENTS_ANSWER);
    assert!(answer.citations.is_empty());
    assert!(answer.chunks.is_empty());
}

#[tokio::test]
async fn single_chunk_document_yields_one_citation() {
    let vault = memory_vault(&test_config());
    let doc = vault
        .upload(markdown("alice", "tip.md", "Tram 28 is fun."))
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Processed);
    assert_eq!(doc.chunk_count, 1);

    let answer = vault.query("alice", "which tram?", None).await.unwrap();
    assert_eq!(answer.answer, "answered from 1 sources");
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].source, 1);
    assert_eq!(answer.citations[0].document_id, doc.id);
    assert_eq!(answer.citations[0].title, "tip");
    assert_eq!(answer.tokens_used, Some(42));
}

#[tokio::test]
async fn top_k_larger_than_vault_returns_every_chunk() {
    let mut config = test_config();
    config.chunking.chunk_tokens = 400;
    let vault = memory_vault(&config);
    vault
        .upload(markdown("alice", "a.md", "Sintra palaces are colourful."))
        .await
        .unwrap();
    vault
        .upload(markdown("alice", "b.md", "Cascais beaches are sandy."))
        .await
        .unwrap();

    let answer = vault.query("alice", "day trips", Some(3)).await.unwrap();
    assert_eq!(answer.chunks.len(), 2);
    assert_eq!(answer.citations.len(), 2);
    let sources: Vec<usize> = answer.citations.iter().map(|c| c.source).collect();
    assert_eq!(sources, vec![1, 2]);
}

#[tokio::test]
async fn users_never_see_each_others_chunks() {
    let vault = memory_vault(&test_config());
    vault
        .upload(markdown("alice", "lisbon.md", &lisbon_guide()))
        .await
        .unwrap();

    let answer = vault.query("bob", "tram 28", None).await.unwrap();
    assert_eq!(answer.answer, NO_DOCUMENTS_ANSWER);
    assert!(vault.list("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_removes_only_that_document() {
    let vault = memory_vault(&test_config());
    let keep = vault
        .upload(markdown("alice", "keep.md", &lisbon_guide()))
        .await
        .unwrap();
    let gone = vault
        .upload(markdown("alice", "gone.md", "Porto has port wine cellars in Gaia."))
        .await
        .unwrap();
    let before = vault.index().len("alice").await;

    vault.delete("alice", &gone.id).await.unwrap();

    assert_eq!(vault.index().document_len("alice", &gone.id).await, 0);
    assert_eq!(
        vault.index().document_len("alice", &keep.id).await,
        keep.chunk_count
    );
    assert_eq!(vault.index().len("alice").await, before - gone.chunk_count);
    assert!(matches!(
        vault.get("alice", &gone.id).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        vault.delete("alice", &gone.id).await,
        Err(VaultError::NotFound(_))
    ));

    let answer = vault.query("alice", "port wine cellars", Some(10)).await.unwrap();
    assert!(answer.citations.iter().all(|c| c.document_id == keep.id));
}

#[tokio::test]
async fn other_users_cannot_delete() {
    let vault = memory_vault(&test_config());
    let doc = vault
        .upload(markdown("alice", "lisbon.md", &lisbon_guide()))
        .await
        .unwrap();
    assert!(matches!(
        vault.delete("bob", &doc.id).await,
        Err(VaultError::NotFound(_))
    ));
    assert_eq!(
        vault.index().document_len("alice", &doc.id).await,
        doc.chunk_count
    );
}

#[tokio::test]
async fn reupload_after_failure_is_a_new_document() {
    let vault = memory_vault(&test_config());
    let mut bad = markdown("alice", "guide.exe", "MZ");
    bad.content_type = None;
    let failed = vault.upload(bad).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    let reason = failed.failure.clone().unwrap();
    assert_eq!(reason.stage, FailureStage::Extraction);
    assert_eq!(vault.index().len("alice").await, 0);

    let ok = vault
        .upload(markdown("alice", "guide.md", &lisbon_guide()))
        .await
        .unwrap();
    assert_ne!(ok.id, failed.id);
    assert_eq!(ok.status, DocumentStatus::Processed);

    let still_failed = vault.get("alice", &failed.id).await.unwrap();
    assert_eq!(still_failed.status, DocumentStatus::Failed);
    assert_eq!(vault.list("alice").await.unwrap().len(), 2);
}

#[tokio::test]
async fn listing_is_newest_first() {
    let vault = memory_vault(&test_config());
    let first = vault.upload(markdown("alice", "one.md", "One.")).await.unwrap();
    let second = vault.upload(markdown("alice", "two.md", "Two.")).await.unwrap();
    let ids: Vec<String> = vault
        .list("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);
}

#[tokio::test]
async fn queries_never_observe_partial_documents() {
    let mut config = test_config();
    config.embedding.batch_size = 1;
    let vault = Arc::new(Vault::new(
        &config,
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(SlowEmbedder {
            inner: HashProvider::new(DIMS),
            delay: Duration::from_millis(15),
        }),
        Arc::new(CountingGenerator),
    ));

    let accepted = vault
        .pipeline()
        .submit(markdown("alice", "lisbon.md", &lisbon_guide()))
        .await
        .unwrap();
    assert_eq!(accepted.status, DocumentStatus::Processing);

    let mut observed = Vec::new();
    let done = loop {
        observed.push(vault.index().document_len("alice", &accepted.id).await);
        let current = vault.get("alice", &accepted.id).await.unwrap();
        if current.status.is_terminal() {
            break current;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };

    assert_eq!(done.status, DocumentStatus::Processed);
    observed.push(vault.index().document_len("alice", &accepted.id).await);
    assert!(
        observed.iter().all(|&n| n == 0 || n == done.chunk_count),
        "saw a partial document: {:?} (final {})",
        observed,
        done.chunk_count
    );
    assert_eq!(observed.last(), Some(&done.chunk_count));
}

#[tokio::test]
async fn restart_reloads_index_and_fails_interrupted_documents() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config();
    config.db.path = tmp.path().join("data/vault.sqlite");

    let (processed, interrupted) = {
        let vault = sqlite_vault(&config).await;
        let processed = vault
            .upload(markdown("alice", "lisbon.md", &lisbon_guide()))
            .await
            .unwrap();
        // Accepted but never processed, as if the process died mid-flight.
        let interrupted = vault
            .pipeline()
            .accept(&markdown("alice", "porto.md", "Porto."))
            .await
            .unwrap();
        (processed, interrupted)
    };

    let vault = sqlite_vault(&config).await;
    assert_eq!(vault.index().len("alice").await, 0);
    let report = vault.recover().await.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.documents, 1);
    assert_eq!(report.chunks, processed.chunk_count);
    assert_eq!(
        vault.index().document_len("alice", &processed.id).await,
        processed.chunk_count
    );

    let failed = vault.get("alice", &interrupted.id).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert_eq!(failed.failure.unwrap().stage, FailureStage::Interrupted);

    let answer = vault.query("alice", "tram 28 Alfama", None).await.unwrap();
    assert!(!answer.citations.is_empty());
    assert!(answer
        .citations
        .iter()
        .all(|c| c.document_id == processed.id));
}

#[tokio::test]
async fn blank_query_is_rejected() {
    let vault = memory_vault(&test_config());
    vault.upload(markdown("alice", "tip.md", "Tram 28.")).await.unwrap();
    let err = vault.query("alice", "   ", None).await.unwrap_err();
    assert!(matches!(err, VaultError::Query(_)));
}

#[tokio::test]
async fn delete_from_another_process_is_never_cited() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config();
    config.db.path = tmp.path().join("data/vault.sqlite");
    config.embedding.provider = "hash".to_string();
    config.embedding.dims = Some(DIMS);

    let server = sqlite_vault(&config).await;
    let keep = server
        .upload(markdown("alice", "keep.md", "Sintra palaces are colourful."))
        .await
        .unwrap();
    let gone = server
        .upload(markdown("alice", "gone.md", "Porto has port wine cellars in Gaia."))
        .await
        .unwrap();

    // A second handle on the same database, as a CLI command would open.
    let cli = Vault::attach(&config).await.unwrap();
    assert_eq!(
        cli.index().document_len("alice", &gone.id).await,
        gone.chunk_count
    );
    cli.delete("alice", &gone.id).await.unwrap();

    let answer = server
        .query("alice", "port wine cellars in Gaia", Some(5))
        .await
        .unwrap();
    assert!(!answer.citations.is_empty());
    assert!(answer.citations.iter().all(|c| c.document_id == keep.id));
    assert_eq!(server.index().document_len("alice", &gone.id).await, 0);
    assert_eq!(
        server.index().document_len("alice", &keep.id).await,
        keep.chunk_count
    );
}

#[tokio::test]
async fn open_refuses_documents_the_index_cannot_hold() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config();
    config.db.path = tmp.path().join("data/vault.sqlite");
    config.embedding.provider = "hash".to_string();
    config.embedding.dims = Some(DIMS);

    let stale_id = {
        let vault = sqlite_vault(&config).await;
        vault
            .upload(markdown("alice", "lisbon.md", &lisbon_guide()))
            .await
            .unwrap();
        // Written by an earlier configuration with narrower vectors.
        let stale = vault
            .pipeline()
            .accept(&markdown("alice", "old.md", "Old notes."))
            .await
            .unwrap();
        let chunk = Chunk {
            id: format!("{}-0", stale.id),
            document_id: stale.id.clone(),
            ordinal: 0,
            text: "Old notes.".to_string(),
            token_count: 3,
            embedding: vec![0.5; 8],
        };
        vault
            .store()
            .complete("alice", &stale.id, &[chunk], 3)
            .await
            .unwrap()
            .unwrap();
        stale.id
    };

    let err = Vault::open(&config).await.err().expect("open must refuse");
    assert!(err.to_string().contains(&stale_id), "error: {}", err);

    let cli = Vault::attach(&config).await.unwrap();
    cli.delete("alice", &stale_id).await.unwrap();
    drop(cli);

    let vault = Vault::open(&config).await.unwrap();
    assert_eq!(vault.list("alice").await.unwrap().len(), 1);
}
