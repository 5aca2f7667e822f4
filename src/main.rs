//! # RAG Harness CLI (`rag`)
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag ingest [--root DIR]` | Chunk, embed and index files under a directory |
//! | `rag delete <id>` | Remove a document and its chunks from the index |
//! | `rag search "<query>"` | Show fused (and reranked) candidates |
//! | `rag ask "<question>"` | Stream a cited answer to the terminal |
//! | `rag serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rag_harness::{ask, config, ingest, logging, migrate, search, server};

/// RAG Harness: hybrid retrieval and cited, streamed answers over local documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "rag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Index every matching file under a directory.
    ///
    /// Each file replaces its previous version atomically. Unchanged text
    /// yields identical chunk ids.
    Ingest {
        /// Directory to scan. Defaults to `[ingest].root`.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Delete a document (by id, the path relative to the ingest root).
    Delete {
        document_id: String,
    },

    /// Run retrieval only and print the candidates.
    Search {
        query: String,

        /// Maximum number of results to print.
        #[arg(long)]
        limit: Option<usize>,

        /// Skip the reranker and show fused order.
        #[arg(long)]
        no_rerank: bool,
    },

    /// Answer a question with citations.
    Ask {
        question: String,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { root } => {
            ingest::run_ingest(&cfg, root).await?;
        }
        Commands::Delete { document_id } => {
            ingest::run_delete(&cfg, &document_id).await?;
        }
        Commands::Search {
            query,
            limit,
            no_rerank,
        } => {
            search::run_search(&cfg, &query, limit, no_rerank).await?;
        }
        Commands::Ask { question } => {
            ask::run_ask(&cfg, &question).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
