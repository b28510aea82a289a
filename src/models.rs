//! Core data models used throughout the vault.
//!
//! These types represent the documents, chunks, and uploads that flow
//! through the ingestion pipeline and the query engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an uploaded document.
///
/// ```text
/// PROCESSING ──▶ PROCESSED
///      │
///      └──────▶ FAILED
/// ```
///
/// Both `PROCESSED` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Processing,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Processed => "PROCESSED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::Processing)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Processing, DocumentStatus::Processed)
                | (DocumentStatus::Processing, DocumentStatus::Failed)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "PROCESSED" => Ok(DocumentStatus::Processed),
            "FAILED" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

/// Pipeline stage at which a document failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Extraction,
    Embedding,
    Index,
    /// The process stopped while the document was still `PROCESSING`.
    Interrupted,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Extraction => "extraction",
            FailureStage::Embedding => "embedding",
            FailureStage::Index => "index",
            FailureStage::Interrupted => "interrupted",
        }
    }
}

impl FromStr for FailureStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "extraction" => Ok(FailureStage::Extraction),
            "embedding" => Ok(FailureStage::Embedding),
            "index" => Ok(FailureStage::Index),
            "interrupted" => Ok(FailureStage::Interrupted),
            other => anyhow::bail!("unknown failure stage: {}", other),
        }
    }
}

/// Human-readable reason recorded on a `FAILED` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub stage: FailureStage,
    pub message: String,
}

impl FailureReason {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage.as_str(), self.message)
    }
}

/// Metadata record for one uploaded file.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub filename: String,
    pub notes: Option<String>,
    pub content_type: Option<String>,
    pub status: DocumentStatus,
    pub failure: Option<FailureReason>,
    pub chunk_count: usize,
    pub token_estimate: usize,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            filename: self.filename.clone(),
            notes: self.notes.clone(),
            status: self.status,
            failure_reason: self.failure.as_ref().map(|f| f.to_string()),
            chunk_count: self.chunk_count,
            token_estimate: self.token_estimate,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Wire shape of a document in listings and upload responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub chunk_count: usize,
    pub token_estimate: usize,
    pub created_at: String,
}

/// A contiguous span of a document's extracted text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position within the document, contiguous from 0.
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    /// Empty until the chunk has been embedded.
    pub embedding: Vec<f32>,
}

/// A file handed to the vault by an authenticated user.
#[derive(Debug, Clone)]
pub struct Upload {
    pub user_id: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    /// Title supplied by the user, or the filename stem, or a placeholder.
    pub fn resolved_title(&self) -> String {
        if let Some(title) = self.title.as_deref().map(str::trim) {
            if !title.is_empty() {
                return title.to_string();
            }
        }
        self.filename
            .as_deref()
            .map(std::path::Path::new)
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Untitled document".to_string())
    }

    pub fn resolved_filename(&self) -> String {
        self.filename
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| "document".to_string())
    }
}
