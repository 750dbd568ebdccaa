//! # Ingest Harness CLI (`ingest`)
//!
//! Loads annotation items from the configured data sources into an
//! append-only item store (`<output.dir>/items.jsonl`).
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest sources` | List configured sources, their status and the registered types |
//! | `ingest load` | Initial load of every source |
//! | `ingest more <id>` | Load the next batch from one source |
//! | `ingest auto --annotated N` | Load more from sources whose annotation ratio crossed the threshold |
//! | `ingest refresh <id>` | Drop cached payload and read position for a source |
//! | `ingest stats` | Print stats as JSON |
//! | `ingest cache clear` / `cleanup` | Remove all / expired cache entries |
//!
//! Logs go to stderr (`RUST_LOG` overrides `-v`), results to stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingest_harness::config::load_config;
use ingest_harness::ingest::DataSourceManager;
use ingest_harness::registry::SourceRegistry;
use ingest_harness::sources::list_sources;
use ingest_harness::store::{ItemStore, JsonlItemStore};

/// Ingest Harness: pluggable, cached, incremental ingestion of annotation items.
#[derive(Parser)]
#[command(name = "ingest", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    /// Log progress at info level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured sources and registered source types.
    Sources,

    /// Run the initial load over every source.
    Load,

    /// Load the next batch from one source.
    More {
        source_id: String,

        /// Override the configured batch size.
        #[arg(long)]
        count: Option<usize>,
    },

    /// Load more from every source whose annotated/delivered ratio crossed
    /// the auto-load threshold.
    Auto {
        /// Items annotated so far.
        #[arg(long)]
        annotated: u64,

        /// Items delivered so far; defaults to the item store size.
        #[arg(long)]
        total: Option<u64>,
    },

    /// Invalidate cache and read position for one source.
    Refresh { source_id: String },

    /// Print manager, cache and partial-loading stats as JSON.
    Stats,

    /// Manage the payload cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cache entry.
    Clear,
    /// Remove expired cache entries.
    Cleanup,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "ingest_harness=info,ingest=info"
    } else {
        "ingest_harness=warn,ingest=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let registry = SourceRegistry::with_builtins();
    let store = Arc::new(JsonlItemStore::open(&config.output.dir)?);
    let manager = DataSourceManager::new(&config, &registry, store.clone())?;

    let result = dispatch(cli.command, &manager, &registry, &*store);
    manager.close();
    result
}

fn dispatch(
    command: Commands,
    manager: &DataSourceManager,
    registry: &SourceRegistry,
    store: &dyn ItemStore,
) -> Result<()> {
    match command {
        Commands::Sources => list_sources(manager, registry),
        Commands::Load => {
            let added = manager.load_initial_data();
            println!("loaded {} new items ({} total)", added, store.len());
        }
        Commands::More { source_id, count } => {
            let added = manager.load_more(&source_id, count)?;
            println!("loaded {} new items from {}", added, source_id);
        }
        Commands::Auto { annotated, total } => {
            let total = total.unwrap_or(store.len() as u64);
            let loaded = manager.check_auto_load(annotated, total);
            if loaded.is_empty() {
                println!("no source needs more items");
            }
            for (source_id, added) in loaded {
                println!("loaded {} new items from {}", added, source_id);
            }
        }
        Commands::Refresh { source_id } => {
            let ok = manager.refresh_source(&source_id)?;
            println!("refreshed {} ({})", source_id, if ok { "ok" } else { "failed" });
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&manager.get_stats())?);
        }
        Commands::Cache { action } => match action {
            CacheAction::Clear => println!("cleared {} cache entries", manager.clear_cache()?),
            CacheAction::Cleanup => {
                println!("removed {} expired cache entries", manager.cache_cleanup()?)
            }
        },
    }
    Ok(())
}
