//! # Knowledge Vault
//!
//! A per-user document vault with retrieval-augmented answers.
//!
//! Users upload travel guides and notes (PDF, DOCX, Markdown, plain text).
//! Each upload is extracted, chunked, embedded, and committed to the user's
//! private vector index. Questions are answered by a language model grounded
//! only in the user's own top-ranked chunks, with `[Source N]` citations.
//!
//! ## Architecture
//!
//! ```text
//!  upload ──▶ ┌──────────────────────────────────────────┐
//!             │ IngestPipeline                            │
//!             │ extract → chunk → embed → commit          │
//!             └──────┬───────────────────────────┬───────┘
//!                    ▼                           ▼
//!             ┌──────────────┐          ┌────────────────┐
//!             │ DocumentStore │          │ VectorIndex     │
//!             │ SQLite/memory │          │ one per user    │
//!             └──────────────┘          └───────┬────────┘
//!                                               ▼
//!  query  ──▶ QueryEngine: embed → top-k → grounded prompt → Generator
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vault --config ./config/vault.toml init
//! vault --config ./config/vault.toml ingest --user alice --file lisbon.md
//! vault --config ./config/vault.toml query --user alice "best tram route?"
//! vault --config ./config/vault.toml serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Documents, chunks, lifecycle status |
//! | [`extract`] | PDF / DOCX / Markdown / text extraction |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Generation provider abstraction |
//! | [`index`] | Per-user vector index |
//! | [`store`] | Document store (SQLite, in-memory) |
//! | [`ingest`] | Ingestion pipeline |
//! | [`query`] | Query engine |
//! | [`vault`] | Facade and startup recovery |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod server;
pub mod store;
pub mod vault;
