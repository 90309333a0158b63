//! # itsm-sync CLI
//!
//! ## Usage
//!
//! ```bash
//! itsm-sync --config ./config/itsm-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `itsm-sync init` | Create the SQLite database and tables |
//! | `itsm-sync sync <all\|Category> [--full]` | Run one or all category pipelines |
//! | `itsm-sync status` | Print sync state rows and artifact counts |
//! | `itsm-sync release-stale` | Release locks older than the lock timeout |
//! | `itsm-sync reconcile` | Remove artifacts of records deleted at the source |
//! | `itsm-sync reset <Category>` | Delete a category's artifacts and zero its watermark |
//! | `itsm-sync serve` | Run the scheduler and the admin HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! itsm-sync init
//! itsm-sync sync all
//! itsm-sync sync KnowledgeArticle --full
//! RUST_LOG=itsm_sync=debug itsm-sync serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use itsm_sync::{config, ingest, logging, migrate, server};

/// Incremental synchronization of ITSM records into a local vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/itsm-sync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "itsm-sync",
    about = "Incremental, crash-safe sync of ITSM records into a local vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/itsm-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Sync changed records into the index.
    ///
    /// Each category syncs from its own watermark under its own lock. A
    /// category whose lock is held elsewhere is reported as skipped.
    Sync {
        /// `all` or a category: Incident, WorkOrder, KnowledgeArticle, ChangeRequest.
        target: String,

        /// Discard the watermark and the category's artifacts, then resync everything.
        #[arg(long)]
        full: bool,
    },

    /// Show per-category sync state.
    Status,

    /// Release `running` locks older than `sync.lock_timeout_minutes`.
    ReleaseStale,

    /// Remove artifacts whose records no longer exist at the source.
    Reconcile,

    /// Delete a category's artifacts and set its watermark to 0.
    Reset {
        category: String,
    },

    /// Run scheduled syncs and the admin HTTP server until Ctrl-C.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing("info");

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { target, full } => {
            ingest::run_sync(&cfg, &target, full).await?;
        }
        Commands::Status => {
            ingest::run_status(&cfg).await?;
        }
        Commands::ReleaseStale => {
            ingest::run_release_stale(&cfg).await?;
        }
        Commands::Reconcile => {
            ingest::run_reconcile(&cfg).await?;
        }
        Commands::Reset { category } => {
            ingest::run_reset(&cfg, &category).await?;
        }
        Commands::Serve => {
            server::run_serve(&cfg).await?;
        }
    }

    Ok(())
}
