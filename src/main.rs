//! # askdocs CLI
//!
//! The `askdocs` binary is the primary interface to the pipeline. It
//! provides commands for database initialization, document ingestion,
//! status polling, querying, and corpus management.
//!
//! ## Usage
//!
//! ```bash
//! askdocs --config ./config/askdocs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askdocs init` | Create the SQLite database and run schema migrations |
//! | `askdocs ingest <file>` | Upload a PDF/PPTX and process it in the background |
//! | `askdocs status <id>` | Poll a document's processing status |
//! | `askdocs list` | List ingested documents |
//! | `askdocs query "<text>"` | Ask a question against the corpus |
//! | `askdocs delete <id>` | Delete a document and its chunks/embeddings |
//! | `askdocs stats` | Show corpus counters |
//!
//! The embedding and generation providers read `GEMINI_API_KEY` from the
//! environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use askdocs::config;
use askdocs::db;
use askdocs::embedding::GeminiEmbedder;
use askdocs::extract::DocumentExtractor;
use askdocs::generation::GeminiGenerator;
use askdocs::migrate;
use askdocs::models::ContentKind;
use askdocs::pipeline::QueryOptions;
use askdocs::store::sqlite::SqliteStore;
use askdocs::Pipeline;

/// Client key used for the CLI's rate-limiter bucket.
const LOCAL_CLIENT: &str = "local";

/// askdocs — a retrieval-augmented question-answering pipeline for
/// document corpora.
#[derive(Parser)]
#[command(
    name = "askdocs",
    about = "Ask questions against a corpus of uploaded documents",
    version,
    long_about = "askdocs ingests PDF and PPTX documents into searchable, attributable chunks, \
    embeds them through an external provider, and answers natural-language questions with \
    source citations and a confidence estimate."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askdocs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, embeddings). Idempotent.
    Init,

    /// Upload a document and process it in the background.
    ///
    /// Validates size and type, persists the document as `pending`, and
    /// starts chunking and embedding. Prints the document id immediately
    /// unless `--wait` is given.
    Ingest {
        /// Path to the PDF or PPTX file.
        file: PathBuf,

        /// Override the MIME type inferred from the file extension.
        #[arg(long)]
        content_type: Option<String>,

        /// Block until processing reaches a terminal status.
        #[arg(long)]
        wait: bool,

        /// Timeout in seconds when used with --wait.
        #[arg(long, default_value_t = 300)]
        wait_timeout: u64,
    },

    /// Poll a document's processing status.
    Status {
        /// Document id returned by `ingest`.
        id: String,
    },

    /// List ingested documents, newest first.
    List {
        /// Maximum number of documents to show.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Ask a question against the corpus.
    ///
    /// Embeds the question, retrieves the most similar chunks above the
    /// similarity threshold, and synthesizes an answer with source
    /// citations and a confidence score.
    Query {
        /// The question text.
        text: String,

        /// Maximum number of chunks to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum cosine similarity for retrieved chunks.
        #[arg(long)]
        min_similarity: Option<f32>,

        /// Print the full answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete a document and cascade its chunks and embeddings.
    Delete {
        /// Document id.
        id: String,
    },

    /// Show corpus counters (documents, chunks, embeddings).
    Stats,
}

/// Infer a MIME type from the file extension.
fn infer_content_type(path: &PathBuf) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "pdf" => Some(ContentKind::Pdf.as_mime()),
        "pptx" => Some(ContentKind::Pptx.as_mime()),
        _ => None,
    }
}

async fn build_pipeline(cfg: &config::Config) -> anyhow::Result<Pipeline> {
    let pool = db::connect(&cfg.db).await?;
    let store = Arc::new(SqliteStore::new(pool, cfg.embedding.dims));
    let embedder = Arc::new(GeminiEmbedder::from_env(&cfg.embedding)?);
    let generator = Arc::new(GeminiGenerator::from_env(&cfg.generation)?);

    Ok(Pipeline::new(
        cfg.clone(),
        store,
        Arc::new(DocumentExtractor),
        embedder,
        generator,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        config::Config::default()
    };

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            content_type,
            wait,
            wait_timeout,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read file: {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            let mime = match content_type {
                Some(ct) => ct,
                None => infer_content_type(&file)
                    .context("Cannot infer content type; pass --content-type")?
                    .to_string(),
            };

            let pipeline = build_pipeline(&cfg).await?;
            let handle = pipeline
                .ingest(LOCAL_CLIENT, bytes, &file_name, &mime)
                .await?;
            println!("document id: {}", handle.document_id());

            if wait {
                let status = handle
                    .wait_until_done(Duration::from_secs(wait_timeout))
                    .await?;
                println!("status: {}", status);
            } else {
                println!("status: pending (poll with `askdocs status <id>`)");
            }
        }
        Commands::Status { id } => {
            let pipeline = build_pipeline(&cfg).await?;
            let status = pipeline.get_status(&id).await?;
            println!("{}", status);
        }
        Commands::List { limit } => {
            let pipeline = build_pipeline(&cfg).await?;
            let documents = pipeline.list_documents(limit).await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for doc in documents {
                println!(
                    "{}  {:<10}  {:>8}B  {}",
                    doc.id, doc.status, doc.byte_size, doc.file_name
                );
            }
        }
        Commands::Query {
            text,
            top_k,
            min_similarity,
            json,
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let options = QueryOptions {
                top_k,
                min_similarity,
            };
            let answer = pipeline.query(LOCAL_CLIENT, &text, options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}\n", answer.answer);
                if !answer.sources.is_empty() {
                    println!("Sources:");
                    for source in &answer.sources {
                        let page = source
                            .page_number
                            .map(|p| format!(", page {}", p))
                            .unwrap_or_default();
                        println!(
                            "  - {}{} (relevance {:.0}%)",
                            source.document_name,
                            page,
                            source.similarity * 100.0
                        );
                    }
                }
                println!(
                    "\nconfidence: {:.2}  ({:.2}s)",
                    answer.confidence, answer.processing_time
                );
            }
        }
        Commands::Delete { id } => {
            let pipeline = build_pipeline(&cfg).await?;
            if pipeline.delete_document(&id).await? {
                println!("Deleted {}.", id);
            } else {
                println!("No document with id {}.", id);
            }
        }
        Commands::Stats => {
            let pipeline = build_pipeline(&cfg).await?;
            let stats = pipeline.stats().await?;
            println!("documents:  {}", stats.documents);
            println!("chunks:     {}", stats.chunks);
            println!("embeddings: {}", stats.embeddings);
        }
    }

    Ok(())
}
