//! # Strata CLI (`strata`)
//!
//! ## Usage
//!
//! ```bash
//! strata --config ./config/strata.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `strata init` | Write a default config (if missing) and create the database |
//! | `strata source add <path>` | Register a directory or file |
//! | `strata source remove <id>` | Unregister a source and drop its index entries |
//! | `strata source list` | Show registered sources and their sync state |
//! | `strata sync [<id> \| --all]` | Bring the indexes in line with the files |
//! | `strata search "<query>"` | Hybrid search over everything indexed |
//! | `strata completions <shell>` | Print shell completions |

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use strata::config::{self, Config, DEFAULT_CONFIG};
use strata::engine::Engine;
use strata::progress::ProgressMode;
use strata::search::SearchArgs;
use strata::{ingest, logging, search, sources};

/// Strata: local hybrid retrieval over your own files.
#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata: local hybrid (full-text, vector, graph) retrieval over your own files",
    version,
    long_about = "Strata indexes registered directories into three stores (SQLite FTS5, \
    embedding vectors and an entity graph), keeps them in sync incrementally, and answers \
    queries by fusing the three rankings."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/strata.toml")]
    config: PathBuf,

    /// Log at debug level unless STRATA_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file (if missing) and the database.
    ///
    /// Safe to run repeatedly; an existing config is left untouched.
    Init,

    /// Manage registered sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Sync one source, or all of them.
    ///
    /// Unchanged files are skipped by fingerprint; failed store writes
    /// from earlier runs are retried.
    Sync {
        /// Source id. Omit (or pass --all) to sync every source.
        source: Option<String>,

        #[arg(long, conflicts_with = "source")]
        all: bool,

        /// Progress output on stderr: off, human or json.
        /// Defaults to human on a terminal, off otherwise.
        #[arg(long)]
        progress: Option<String>,

        /// Print the sync reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search indexed content.
    Search {
        query: String,

        /// hybrid (default), semantic, or lexical (alias: keyword).
        #[arg(long)]
        mode: Option<String>,

        /// Restrict to a source id. Repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Restrict to a content type or extension (markdown, pdf, rs, code). Repeatable.
        #[arg(long = "type")]
        types: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// Show per-signal ranks and contributions.
        #[arg(long)]
        explain: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a directory or a single file.
    Add {
        path: PathBuf,

        /// Glob a file must match to be indexed. Repeatable.
        #[arg(long)]
        include: Vec<String>,

        /// Glob excluding files. Repeatable.
        #[arg(long)]
        exclude: Vec<String>,

        #[arg(long)]
        json: bool,
    },
    /// Unregister a source and remove everything indexed from it.
    Remove { id: String },
    /// List sources with their sync state.
    List {
        #[arg(long)]
        json: bool,
    },
}

/// Write the default config when none exists yet.
fn ensure_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// A token cancelled on Ctrl-C. In-flight documents finish; nothing new starts.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight work");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "strata", &mut io::stdout());
        return Ok(());
    }

    let created = if matches!(cli.command, Commands::Init) {
        ensure_config(&cli.config)?
    } else {
        false
    };
    let cfg: Config = config::load_config(&cli.config)?;
    logging::init(&cfg.logging, cli.verbose);

    match cli.command {
        Commands::Init => {
            Engine::open(&cfg).await?;
            if created {
                println!("Wrote default config to {}", cli.config.display());
            }
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Source { action } => {
            let engine = Engine::open(&cfg).await?;
            match action {
                SourceAction::Add {
                    path,
                    include,
                    exclude,
                    json,
                } => sources::run_add(&engine, &path, &include, &exclude, json).await?,
                SourceAction::Remove { id } => sources::run_remove(&engine, &id).await?,
                SourceAction::List { json } => sources::run_list(&engine, json).await?,
            }
        }
        Commands::Sync {
            source,
            all,
            progress,
            json,
        } => {
            let mode = match progress {
                Some(p) => p.parse::<ProgressMode>()?,
                None => ProgressMode::default_for_tty(),
            };
            let engine = Engine::open_with_events(&cfg, mode.sink()).await?;
            let target = ingest::target(source, all);
            let cancel = cancel_on_ctrl_c();
            if !ingest::run_sync(&engine, &target, json, &cancel).await? {
                anyhow::bail!("one or more sources failed to sync");
            }
        }
        Commands::Search {
            query,
            mode,
            sources,
            types,
            limit,
            explain,
            json,
        } => {
            let engine = Engine::open(&cfg).await?;
            let args = SearchArgs {
                query,
                mode,
                sources,
                types,
                limit,
                explain,
                json,
            };
            let cancel = cancel_on_ctrl_c();
            search::run_search(&engine, &args, &cancel).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
