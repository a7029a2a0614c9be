//! replisearch CLI entry point

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use replisearch::{
    commands::{
        cmd_ensure_indexes, cmd_index_reset, cmd_init, cmd_install_triggers, cmd_queue_process,
        cmd_queue_watch, cmd_search, cmd_status, cmd_sync, cmd_verify, print_batch_summary,
        print_indexing_summary, print_reset_outcome, print_search_results, print_status,
        print_sync_reports, print_trigger_report, print_verification, SearchOptions,
    },
    config::Config,
    context::AppContext,
    error::Result,
    progress::LogWriterFactory,
    router::EngineKind,
};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "replisearch")]
#[command(version, about = "Mirror relational tables into a search index and query both", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and starter catalog
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Rebuild the search index from the relational tables
    Sync {
        /// Only resync this table (schema.table)
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Change queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Secondary (relational) index maintenance
    Indexes {
        #[command(subcommand)]
        action: IndexesAction,
    },

    /// Search both engines
    Search {
        /// The search query
        query: String,

        /// Page number (1-based)
        #[arg(short, long, default_value = "1")]
        page: usize,

        /// Results per page
        #[arg(short, long, default_value = "0", hide_default_value = true)]
        limit: usize,

        /// Column filter as column=value; forces the relational engine
        #[arg(short, long)]
        filter: Vec<String>,

        /// Follow links between records; forces the relational engine
        #[arg(long)]
        follow_links: bool,

        /// Link depth when following links
        #[arg(long, default_value = "1")]
        depth: u32,

        /// Engine to race first
        #[arg(long, value_enum)]
        prefer: Option<PreferEngine>,

        /// Include per-engine timings
        #[arg(long)]
        diagnostics: bool,
    },

    /// Compare table row counts with index document counts
    Verify,

    /// Search index management
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show system status
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Process one batch of pending change events
    Process {
        /// Maximum events to process
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Keep processing events on the configured poll interval
    Watch,

    /// Create the queue table and install change triggers
    InstallTriggers,
}

#[derive(Subcommand)]
enum IndexesAction {
    /// Create missing secondary indexes on searchable columns
    Ensure {
        /// List the indexes that would be created
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Delete the index and recreate it empty
    Reset {
        /// Index to reset (defaults to the configured default index)
        #[arg(long)]
        index: Option<String>,

        /// Only delete, do not recreate
        #[arg(long)]
        no_recreate: bool,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PreferEngine {
    Index,
    Relational,
}

impl From<PreferEngine> for EngineKind {
    fn from(value: PreferEngine) -> Self {
        match value {
            PreferEngine::Index => EngineKind::Index,
            PreferEngine::Relational => EngineKind::Relational,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force, cli.json).await;
    }

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "replisearch", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let ctx = AppContext::connect(config).await?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Sync { table } => {
            let reports = cmd_sync(&ctx, table.as_deref(), !cli.json).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_sync_reports(&reports);
            }
        }

        Commands::Queue { action } => match action {
            QueueAction::Process { limit } => {
                let summary = cmd_queue_process(&ctx, limit).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    print_batch_summary(&summary);
                }
            }
            QueueAction::Watch => cmd_queue_watch(&ctx).await?,
            QueueAction::InstallTriggers => {
                let report = cmd_install_triggers(&ctx).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_trigger_report(&report);
                }
            }
        },

        Commands::Indexes {
            action: IndexesAction::Ensure { dry_run },
        } => {
            let summary = cmd_ensure_indexes(&ctx, dry_run).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_indexing_summary(&summary, dry_run);
            }
        }

        Commands::Search {
            query,
            page,
            limit,
            filter,
            follow_links,
            depth,
            prefer,
            diagnostics,
        } => {
            let options = SearchOptions {
                page,
                limit,
                filters: filter,
                follow_links,
                depth,
                prefer: prefer.map(EngineKind::from),
                diagnostics,
            };
            let response = cmd_search(&ctx, &query, options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_search_results(&response);
            }
        }

        Commands::Verify => {
            let report = cmd_verify(&ctx).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_verification(&report);
            }
        }

        Commands::Index {
            action:
                IndexAction::Reset {
                    index,
                    no_recreate,
                    yes,
                },
        } => {
            if !yes {
                eprintln!("⚠️  This will delete ALL documents in the index!");
                eprintln!("Run with --yes to confirm.");
                std::process::exit(1);
            }
            let outcome = cmd_index_reset(&ctx, index.as_deref(), !no_recreate).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_reset_outcome(&outcome);
            }
        }

        Commands::Status => {
            let status = cmd_status(&ctx).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }

    Ok(())
}

async fn handle_init(config: Option<PathBuf>, force: bool, json: bool) -> Result<()> {
    // A .toml path names the config file itself; anything else is a directory
    let base_dir = config.map(|path| {
        if path.extension().is_some_and(|e| e == "toml") {
            path.parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir)
        } else {
            path
        }
    });

    let report = cmd_init(base_dir, force).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("✓ replisearch initialized successfully");
    println!("  Config: {}", report.config_path.display());
    println!("  Catalog: {}", report.catalog_path.display());
    println!("\nNext steps:");
    println!("  1. Point database.url at your SQLite database and describe tables in the catalog");
    println!("  2. Install change triggers: replisearch queue install-triggers");
    println!("  3. Build the index: replisearch sync");
    println!("  4. Keep it current: replisearch queue watch");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'replisearch init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
