//! # Smart File Search CLI (`sfs`)
//!
//! Every command except `init` and `stats` goes through the same guarded
//! operations as the HTTP server, with caller identity `cli`. Results are
//! printed to stdout as JSON; diagnostics go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! sfs --config ./config/sfs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sfs init` | Create the SQLite database and run schema migrations |
//! | `sfs roots` | List allow-listed roots |
//! | `sfs index <root>` | Index new and changed files under a root |
//! | `sfs search "<query>"` | Search indexed files |
//! | `sfs open <path>` | Preview a chunk of an indexed file |
//! | `sfs summarize "<query>" --results r.json` | Summarize search results |
//! | `sfs rewrite "<query>"` | Show the engine query for a request |
//! | `sfs embed pending` | Backfill missing or stale embeddings |
//! | `sfs usage` | Today's AI token usage |
//! | `sfs stats` | Index counts and consistency check |
//! | `sfs serve` | Start the HTTP server |

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use smart_file_search::config;
use smart_file_search::embed_cmd;
use smart_file_search::migrate;
use smart_file_search::server;
use smart_file_search::service::{
    IndexRequest, OpenRequest, ResultRef, RewriteRequest, SearchRequest, Service,
    SummarizeRequest,
};
use smart_file_search::stats;

const CLI_CALLER: &str = "cli";

/// Allow-listed document indexer and guarded search service.
#[derive(Parser)]
#[command(name = "sfs", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sfs.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). `SFS_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List allow-listed roots and their indexed file counts.
    Roots,

    /// Index new and changed files under an allow-listed folder.
    Index {
        /// Folder inside a configured root.
        root: String,

        /// Reprocess every file, not just changed ones.
        #[arg(long)]
        full: bool,

        /// Scheduling hint: low, normal or high.
        #[arg(long)]
        priority: Option<String>,
    },

    /// Search indexed files.
    Search {
        /// Words or "quoted phrases".
        query: String,

        /// Page size.
        #[arg(long)]
        k: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Extension filter, repeatable (`--ext pdf --ext docx`).
        #[arg(long = "ext")]
        exts: Vec<String>,

        /// Modification year filter (UTC), repeatable.
        #[arg(long = "year")]
        years: Vec<i32>,

        /// Restrict to these roots, repeatable.
        #[arg(long = "root")]
        roots: Vec<String>,

        /// Opt in to AI enrichment.
        #[arg(long)]
        ai: bool,
    },

    /// Preview one chunk of an indexed file.
    Open {
        path: String,

        /// Chunk locator such as "page 3"; defaults to the first chunk.
        #[arg(long)]
        pointer: Option<String>,

        #[arg(long)]
        before: Option<usize>,

        #[arg(long)]
        after: Option<usize>,
    },

    /// Summarize search results read from a JSON file of `{path, snippet}`.
    Summarize {
        query: String,

        #[arg(long)]
        results: PathBuf,

        #[arg(long)]
        style: Option<String>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Show the engine query and filters for a natural-language request.
    Rewrite { query: String },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Today's AI token usage against the daily limit.
    Usage,

    /// Index counts, job history and consistency check.
    Stats {
        /// Print as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without embedding.
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SFS_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info,audit=warn"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized at {}", cfg.db.path.display());
        return Ok(());
    }

    let db_path = cfg.db.path.clone();
    let service = Arc::new(Service::open(cfg).await?);

    match cli.command {
        Commands::Init => {}
        Commands::Roots => {
            print_json(&service.list_roots(CLI_CALLER).await?)?;
        }
        Commands::Index {
            root,
            full,
            priority,
        } => {
            let report = service
                .index_folder(CLI_CALLER, IndexRequest { root, full, priority })
                .await?;
            print_json(&report)?;
        }
        Commands::Search {
            query,
            k,
            offset,
            exts,
            years,
            roots,
            ai,
        } => {
            let req = SearchRequest {
                query,
                k,
                offset: Some(offset),
                exts,
                years,
                roots,
                ai,
            };
            print_json(&service.search_files(CLI_CALLER, req).await?)?;
        }
        Commands::Open {
            path,
            pointer,
            before,
            after,
        } => {
            let req = OpenRequest {
                path,
                pointer,
                before,
                after,
            };
            print_json(&service.open_file(CLI_CALLER, req).await?)?;
        }
        Commands::Summarize {
            query,
            results,
            style,
            max_tokens,
        } => {
            let text = std::fs::read_to_string(&results)
                .with_context(|| format!("Failed to read results file: {}", results.display()))?;
            let results: Vec<ResultRef> =
                serde_json::from_str(&text).context("results file must be a JSON array of {path, snippet}")?;
            let req = SummarizeRequest {
                query,
                results,
                style,
                max_tokens,
            };
            print_json(&service.summarize_results(CLI_CALLER, req).await?)?;
        }
        Commands::Rewrite { query } => {
            print_json(&service.rewrite_query(CLI_CALLER, RewriteRequest { query }).await?)?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                let embedder = service
                    .embedder()
                    .context("embedding provider is disabled; set [embedding].provider")?;
                let batch_size = batch_size.unwrap_or(service.config().embedding.batch_size);
                let report = embed_cmd::run_embed_pending(
                    service.store().pool(),
                    &**embedder,
                    batch_size,
                    limit,
                    dry_run,
                )
                .await?;
                print_json(&report)?;
            }
        },
        Commands::Usage => {
            print_json(&service.usage(CLI_CALLER).await?)?;
        }
        Commands::Stats { json } => {
            let stats = stats::collect(service.store()).await?;
            if json {
                print_json(&stats)?;
            } else {
                stats::print(&stats, &db_path);
            }
        }
        Commands::Serve => {
            server::run_server(service).await?;
        }
    }

    Ok(())
}
