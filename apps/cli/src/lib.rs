//! # Tally CLI Library
//!
//! Command-line front end for the Tally finance tracker.
//!
//! ## Module Organization
//! ```text
//! tally_cli/
//! ├── lib.rs          ◄─── You are here (arguments, startup, dispatch)
//! ├── commands/
//! │   ├── mod.rs      ◄─── Output helpers
//! │   ├── ledger.rs   ◄─── books, categories, entries, summaries
//! │   └── sync.rs     ◄─── sync, conflicts, auto-sync, status
//! └── emitter.rs      ◄─── Sync events to the log
//! ```

pub mod commands;
pub mod emitter;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tally_db::{Database, DbConfig, LocalStore};
use tally_sync::{session, remote, RetryPolicy, SyncAgent, SyncConfig};

use crate::commands::ledger::{BookCommand, CategoryCommand, EntryCommand};
use crate::commands::sync::ConflictCommand;
use crate::emitter::LogEmitter;

/// Tally: a personal finance tracker that syncs between your devices.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about)]
pub struct Cli {
    /// Config file (default: platform config dir/sync.toml)
    #[arg(long, global = true, env = "TALLY_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true, env = "TALLY_DB_PATH")]
    pub db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage books
    #[command(subcommand)]
    Book(BookCommand),

    /// Manage categories
    #[command(subcommand)]
    Category(CategoryCommand),

    /// Manage entries
    #[command(subcommand)]
    Entry(EntryCommand),

    /// Income, expense and balance of a book
    Summary { book_id: String },

    /// Sync now, regardless of the auto-sync preference
    Sync,

    /// List, resolve or dismiss sync conflicts
    #[command(subcommand)]
    Conflicts(ConflictCommand),

    /// Turn automatic sync after local changes on or off
    AutoSync {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },

    /// Sync state, last sync time and pending conflicts
    Status,

    /// Write the effective configuration to the config file
    InitConfig,
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally_sync=trace` - Trace the sync engine only
/// - Default: `info,tally=debug,sqlx=warn`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Everything a command needs.
pub struct App {
    pub store: LocalStore,
    pub agent: SyncAgent,
    pub json: bool,
}

/// Parses arguments, runs one command and shuts the sync agent down.
///
/// ## Startup Sequence
/// 1. Load `SyncConfig` (file, then `TALLY_*` environment)
/// 2. Open the SQLite database and run migrations
/// 3. Build the `SyncAgent`, which subscribes to local changes
/// 4. Run the command
/// 5. Shut down: a debounced automatic sync still pending runs now
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SyncConfig::load(cli.config.clone()).context("loading sync config")?;
    if let Some(db) = cli.db.clone() {
        config.storage.database_path = Some(db);
    }

    if let Command::InitConfig = cli.command {
        config.save(cli.config.clone()).context("saving sync config")?;
        println!("Configuration written");
        return Ok(());
    }

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    info!(db_path = %db_path.display(), backend = %config.remote.backend, "Starting");

    let db = Database::new(DbConfig::new(db_path))
        .await
        .context("opening database")?;
    let store = LocalStore::new(db);

    config.validate().context("invalid sync config")?;
    let agent = SyncAgent::builder(store.clone())
        .remote(remote::from_config(&config)?)
        .session(session::from_config(&config)?)
        .retry_policy(RetryPolicy::from_config(&config))
        .debounce(config.sync.debounce())
        .auto_sync_default(config.sync.auto_sync)
        .emitter(Arc::new(LogEmitter))
        .build()
        .await
        .context("starting sync agent")?;

    let app = App {
        store,
        agent,
        json: cli.json,
    };

    let result = dispatch(&app, cli.command).await;

    debug!("Flushing pending sync");
    app.agent.shutdown().await.context("shutting down sync agent")?;
    result
}

async fn dispatch(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Book(cmd) => commands::ledger::book(app, cmd).await,
        Command::Category(cmd) => commands::ledger::category(app, cmd).await,
        Command::Entry(cmd) => commands::ledger::entry(app, cmd).await,
        Command::Summary { book_id } => commands::ledger::summary(app, &book_id).await,
        Command::Sync => commands::sync::sync_now(app).await,
        Command::Conflicts(cmd) => commands::sync::conflicts(app, cmd).await,
        Command::AutoSync { state } => commands::sync::auto_sync(app, state == "on").await,
        Command::Status => commands::sync::status(app).await,
        Command::InitConfig => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_entry_add() {
        let cli = Cli::try_parse_from([
            "tally", "entry", "add", "b-1", "expense", "12.50", "--note", "lunch", "--tag", "food",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Entry(EntryCommand::Add { .. })));
    }

    #[test]
    fn test_parse_resolve_custom() {
        let cli = Cli::try_parse_from(["tally", "conflicts", "resolve", "c-1", "--value", "200.00"])
            .unwrap();
        match cli.command {
            Command::Conflicts(ConflictCommand::Resolve { id, value, .. }) => {
                assert_eq!(id, "c-1");
                assert_eq!(value.as_deref(), Some("200.00"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auto_sync_rejects_other_values() {
        assert!(Cli::try_parse_from(["tally", "auto-sync", "maybe"]).is_err());
    }
}
