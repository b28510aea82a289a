//! # Knowledge Vault CLI (`vault`)
//!
//! ## Usage
//!
//! ```bash
//! vault --config ./config/vault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vault init` | Create the SQLite database and run schema migrations |
//! | `vault serve` | Start the HTTP server |
//! | `vault ingest --user <id> --file <path>` | Ingest one file inline |
//! | `vault list --user <id>` | List a user's documents |
//! | `vault query --user <id> "<question>"` | Ask a grounded question |
//! | `vault delete --user <id> <document-id>` | Delete a document |

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use knowledge_vault::config;
use knowledge_vault::migrate;
use knowledge_vault::models::{DocumentStatus, Upload};
use knowledge_vault::server;
use knowledge_vault::vault::Vault;

/// Knowledge Vault: upload travel documents, ask grounded questions.
#[derive(Parser)]
#[command(name = "vault", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Ingest one file for a user and wait for the result.
    Ingest {
        #[arg(long)]
        user: String,

        #[arg(long)]
        file: PathBuf,

        /// Defaults to the file name without extension.
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List a user's documents, newest first.
    List {
        #[arg(long)]
        user: String,
    },

    /// Answer a question from the user's documents.
    Query {
        #[arg(long)]
        user: String,

        query: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Delete a document and its index entries.
    Delete {
        #[arg(long)]
        user: String,

        id: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("knowledge_vault=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            user,
            file,
            title,
            notes,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let upload = Upload {
                user_id: user,
                filename: file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
                content_type: None,
                title,
                notes,
                bytes,
            };
            let vault = Vault::attach(&cfg).await?;
            let doc = vault.pipeline().ingest(upload).await?;
            match doc.status {
                DocumentStatus::Failed => {
                    let reason = doc
                        .failure
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    bail!("Ingestion of {} failed: {}", doc.id, reason);
                }
                _ => println!(
                    "Ingested {} \"{}\": {} chunks, ~{} tokens",
                    doc.id, doc.title, doc.chunk_count, doc.token_estimate
                ),
            }
        }
        Commands::List { user } => {
            let vault = Vault::attach(&cfg).await?;
            let docs = vault.list(&user).await?;
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                println!(
                    "{}  {:<10}  {:>4} chunks  {}  {}",
                    doc.id,
                    doc.status,
                    doc.chunk_count,
                    doc.created_at.format("%Y-%m-%d %H:%M"),
                    doc.title
                );
                if let Some(failure) = doc.failure {
                    println!("    reason: {}", failure);
                }
            }
        }
        Commands::Query { user, query, top_k } => {
            let vault = Vault::attach(&cfg).await?;
            let answer = vault.query(&user, &query, top_k).await?;
            println!("{}", answer.answer);
            if !answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for (citation, chunk) in answer.citations.iter().zip(&answer.chunks) {
                    println!(
                        "  [Source {}] {} (chunk {}, score {:.3})",
                        citation.source, citation.title, citation.chunk_index, chunk.relevance_score
                    );
                }
            }
        }
        Commands::Delete { user, id } => {
            let vault = Vault::attach(&cfg).await?;
            vault.delete(&user, &id).await?;
            println!("Deleted {}", id);
        }
    }

    Ok(())
}
