//! SQLite-backed [`DocumentStore`].
//!
//! Chunk rows and the `PROCESSED` transition are written in one transaction,
//! so a crash never leaves a processed document without its chunks.
//! Embeddings are stored as little-endian f32 BLOBs. Each commit takes the
//! next `commit_seq`, which orders the chunks when the index is reloaded.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{Chunk, Document, DocumentStatus, FailureReason};

use super::{DocumentStore, IndexedChunk};

const DOCUMENT_COLUMNS: &str = "id, user_id, title, filename, notes, content_type, status, \
     failure_stage, failure_message, chunk_count, token_estimate, created_at";

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.try_get("status")?;
    let failure_stage: Option<String> = row.try_get("failure_stage")?;
    let failure_message: Option<String> = row.try_get("failure_message")?;
    let failure = match failure_stage {
        Some(stage) => Some(FailureReason::new(
            stage.parse()?,
            failure_message.unwrap_or_default(),
        )),
        None => None,
    };
    let created_at: i64 = row.try_get("created_at")?;
    let chunk_count: i64 = row.try_get("chunk_count")?;
    let token_estimate: i64 = row.try_get("token_estimate")?;

    Ok(Document {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        filename: row.try_get("filename")?,
        notes: row.try_get("notes")?,
        content_type: row.try_get("content_type")?,
        status: status.parse()?,
        failure,
        chunk_count: chunk_count.max(0) as usize,
        token_estimate: token_estimate.max(0) as usize,
        created_at: DateTime::<Utc>::from_timestamp_micros(created_at)
            .ok_or_else(|| anyhow!("invalid created_at timestamp: {}", created_at))?,
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn create(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, user_id, title, filename, notes, content_type, status,
                                   failure_stage, failure_message, chunk_count, token_estimate,
                                   created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.user_id)
        .bind(&doc.title)
        .bind(&doc.filename)
        .bind(&doc.notes)
        .bind(&doc.content_type)
        .bind(doc.status.as_str())
        .bind(doc.failure.as_ref().map(|f| f.stage.as_str()))
        .bind(doc.failure.as_ref().map(|f| f.message.as_str()))
        .bind(doc.chunk_count as i64)
        .bind(doc.token_estimate as i64)
        .bind(doc.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ? AND user_id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
            DOCUMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn complete(
        &self,
        user_id: &str,
        id: &str,
        chunks: &[Chunk],
        token_estimate: usize,
    ) -> Result<Option<Document>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, chunk_count = ?, token_estimate = ?,
                commit_seq = (SELECT COALESCE(MAX(commit_seq), 0) + 1 FROM documents)
            WHERE id = ? AND user_id = ? AND status = ?
            "#,
        )
        .bind(DocumentStatus::Processed.as_str())
        .bind(chunks.len() as i64)
        .bind(token_estimate as i64)
        .bind(id)
        .bind(user_id)
        .bind(DocumentStatus::Processing.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, token_count, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(id)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get(user_id, id).await
    }

    async fn fail(
        &self,
        user_id: &str,
        id: &str,
        reason: &FailureReason,
    ) -> Result<Option<Document>> {
        let updated = sqlx::query(
            r#"
            UPDATE documents SET status = ?, failure_stage = ?, failure_message = ?
            WHERE id = ? AND user_id = ? AND status = ?
            "#,
        )
        .bind(DocumentStatus::Failed.as_str())
        .bind(reason.stage.as_str())
        .bind(&reason.message)
        .bind(id)
        .bind(user_id)
        .bind(DocumentStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(user_id, id).await
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE id = ? AND user_id = ?)",
        )
        .bind(id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM documents WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn fail_interrupted(&self, reason: &FailureReason) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE documents SET status = ?, failure_stage = ?, failure_message = ? WHERE status = ?",
        )
        .bind(DocumentStatus::Failed.as_str())
        .bind(reason.stage.as_str())
        .bind(&reason.message)
        .bind(DocumentStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn indexed_chunks(&self) -> Result<Vec<IndexedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT d.user_id, d.title, c.id, c.document_id, c.chunk_index, c.text,
                   c.token_count, c.embedding
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.status = ?
            ORDER BY d.commit_seq, c.chunk_index
            "#,
        )
        .bind(DocumentStatus::Processed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_index: i64 = row.try_get("chunk_index")?;
            let token_count: i64 = row.try_get("token_count")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            out.push(IndexedChunk {
                user_id: row.try_get("user_id")?,
                title: row.try_get("title")?,
                chunk: Chunk {
                    id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    ordinal: chunk_index.max(0) as usize,
                    text: row.try_get("text")?,
                    token_count: token_count.max(0) as usize,
                    embedding: blob_to_vec(&blob),
                },
            });
        }
        Ok(out)
    }
}
