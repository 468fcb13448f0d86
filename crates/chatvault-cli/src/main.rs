//! # chatvault-cli
//!
//! Command-line interface for chatvault.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatvault_core::error::format_error_with_suggestion;
use chatvault_core::Config;
use chatvault_session::{ManagerConfig, SessionManager, SqliteSessionStore, WorkspaceContext};

mod commands;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
    pub project_dir: PathBuf,
    pub database: PathBuf,
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Open the session store and build a manager scoped to the project.
    pub fn manager(&self) -> anyhow::Result<SessionManager> {
        let store = SqliteSessionStore::new(&self.database)
            .map_err(chatvault_session::SessionError::from)
            .map_err(chatvault_core::Error::from)?;
        let project = self.project_dir.display().to_string();
        let workspace = WorkspaceContext::new(&self.project_dir, self.config.context.memory_file.clone());

        Ok(
            SessionManager::new(Arc::new(store), ManagerConfig::from_config(&self.config, project))
                .with_context_source(Arc::new(workspace)),
        )
    }
}

/// chatvault - persistent chat sessions with history compaction
#[derive(Parser)]
#[command(name = "chatvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project directory that scopes sessions (defaults to the current directory)
    #[arg(long, value_name = "PATH", env = "CHATVAULT_PROJECT")]
    project: Option<PathBuf>,

    /// Session database path (overrides storage.database_path)
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session management
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions in the current project
    List {
        /// Maximum sessions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show a session and its (compacted) history
    Show {
        /// Session name
        name: String,
        /// Maximum messages to show (0 = all)
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Delete a session
    Delete {
        /// Session name
        name: String,
    },
    /// Delete sessions not updated within a duration (e.g. 30d, 2w, 6m, 12h)
    Clean {
        /// Age threshold; defaults to storage.retention_days
        #[arg(long, value_name = "DURATION")]
        older_than: Option<String>,
    },
    /// Compact a session's history now
    Compact {
        /// Session name
        name: String,
    },
    /// Export session to a checkpoint file
    Export {
        /// Session name
        name: String,
        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        /// Output format (json, yaml, markdown); defaults from the file extension
        #[arg(short, long)]
        format: Option<String>,
        /// Include the context block
        #[arg(long)]
        context: bool,
        /// Include session metadata
        #[arg(long)]
        metadata: bool,
    },
    /// Import a session from a checkpoint file
    Import {
        /// Checkpoint file (json or yaml)
        file: PathBuf,
        /// Name for the imported session
        #[arg(short, long)]
        name: Option<String>,
        /// Replace an existing session with the same name
        #[arg(long)]
        overwrite: bool,
        /// Restore context items
        #[arg(long)]
        context: bool,
    },
    /// Validate a checkpoint file without importing it
    Validate {
        /// Checkpoint file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<chatvault_core::Error>() {
            Some(err) => eprintln!("Error: {}", format_error_with_suggestion(err)),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let project_dir = match cli.project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let project_dir = project_dir.canonicalize().unwrap_or(project_dir);

    match cli.command {
        Commands::Version => {
            println!("chatvault {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Config { action } => commands::config::handle(action, &project_dir),
        Commands::Session { action } => {
            let config = Config::load_validated(&project_dir)?;
            let database = cli.database.unwrap_or_else(|| config.database_path());

            let cancel = CancellationToken::new();
            let token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling");
                    token.cancel();
                }
            });

            let ctx = AppContext {
                config,
                project_dir,
                database,
                cancel,
            };
            commands::session::handle(action, &ctx).await
        }
    }
}
