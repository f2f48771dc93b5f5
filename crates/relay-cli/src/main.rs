//! Agent Relay CLI - inspect and maintain persisted agent sessions
//!
//! Works on the snapshot file and configuration directly, so it is meant
//! for a stopped relay or for read-only inspection of a running one.

mod render;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use relay_core::config::{Config, ConfigManager};
use relay_core::persistence::PersistenceStore;
use relay_core::session::{SessionRegistry, SessionStatus};
use relay_core::diff_repositories;

#[derive(Parser)]
#[command(name = "relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain agent relay sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State directory holding the session snapshot (overrides the config)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted sessions
    Sessions {
        /// Only show sessions with this status (active, running, complete, error)
        #[arg(long)]
        status: Option<SessionStatus>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one session with its entries
    Show {
        /// Session id
        id: String,
    },

    /// Remove sessions idle for longer than the retention period
    Sweep {
        /// Retention in days (defaults to the configured value)
        #[arg(long)]
        retention_days: Option<u64>,

        /// Report what would be removed without saving
        #[arg(long)]
        dry_run: bool,
    },

    /// Load the snapshot, migrating an older layout in place
    Migrate,

    /// Validate the configuration file
    CheckConfig,

    /// Compare the repositories of the configuration with another file
    DiffConfig {
        /// Configuration to compare against
        other: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());

    // Warn by default so log lines don't interleave with command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,relay_core=debug")
        } else {
            let level = config
                .as_ref()
                .map(|config| config.general.log_level.as_str())
                .unwrap_or("warn");
            EnvFilter::try_new(format!("warn,relay_core={}", level))
                .unwrap_or_else(|_| EnvFilter::new("warn"))
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config?;
    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::DiffConfig { other, json } => diff_config(&config, &other, json),
        command => {
            let state_dir = cli
                .state_dir
                .unwrap_or_else(|| config.persistence.state_dir());
            let store = PersistenceStore::new(&state_dir);
            debug!(path = %store.path().display(), "Using session snapshot");

            match command {
                Commands::Sessions { status, json } => list_sessions(&store, status, json).await,
                Commands::Show { id } => show_session(&store, &id).await,
                Commands::Sweep {
                    retention_days,
                    dry_run,
                } => {
                    let retention = retention_days
                        .map(retention_from_days)
                        .unwrap_or_else(|| config.persistence.retention());
                    sweep(&store, retention, dry_run).await
                }
                Commands::Migrate => migrate(&store).await,
                Commands::CheckConfig | Commands::DiffConfig { .. } => Ok(()),
            }
        }
    }
}

fn retention_from_days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;
    Ok(manager.config().clone())
}

async fn list_sessions(
    store: &PersistenceStore,
    status: Option<SessionStatus>,
    json: bool,
) -> anyhow::Result<()> {
    let registry = load_registry(store).await?;
    let sessions: Vec<_> = registry
        .get_all_sessions()
        .into_iter()
        .filter(|session| status.is_none_or(|status| session.status == status))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        render::session_table(&registry, &sessions);
    }
    Ok(())
}

async fn show_session(store: &PersistenceStore, id: &str) -> anyhow::Result<()> {
    let registry = load_registry(store).await?;
    let session = registry
        .get_session(id)
        .with_context(|| format!("Session not found: {}", id))?;
    render::session_detail(&registry, session);
    Ok(())
}

async fn sweep(store: &PersistenceStore, retention: Duration, dry_run: bool) -> anyhow::Result<()> {
    let mut registry = load_registry(store).await?;
    let removed = registry.cleanup(retention);

    if removed.is_empty() {
        println!("{}", style("No expired sessions").dim());
        return Ok(());
    }
    for id in &removed {
        println!("  {} {}", style("-").red(), id);
    }
    if dry_run {
        println!(
            "{}",
            style(format!("Would remove {} session(s)", removed.len())).yellow()
        );
    } else {
        store.save(&registry.serialize_state()).await?;
        println!(
            "{}",
            style(format!("Removed {} session(s)", removed.len())).green()
        );
    }
    Ok(())
}

async fn migrate(store: &PersistenceStore) -> anyhow::Result<()> {
    match store.load_snapshot().await? {
        Some(snapshot) => println!(
            "{} {} ({} sessions)",
            style("Snapshot is at version").green(),
            snapshot.version,
            snapshot.state.sessions.len()
        ),
        None => println!(
            "{} {}",
            style("No snapshot at").dim(),
            store.path().display()
        ),
    }
    Ok(())
}

/// Load the snapshot into a registry; unlike the relay itself, a snapshot
/// that cannot be read is reported instead of treated as a cold start
async fn load_registry(store: &PersistenceStore) -> anyhow::Result<SessionRegistry> {
    let mut registry = SessionRegistry::new();
    let snapshot = store
        .load_snapshot()
        .await
        .with_context(|| format!("Failed to read {}", store.path().display()))?;
    if let Some(snapshot) = snapshot {
        registry.restore_state(snapshot.state);
    }
    Ok(registry)
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    config
        .backend
        .default_kind()
        .context("Invalid default backend")?;
    for repository in &config.repositories {
        repository
            .backend_kind()
            .with_context(|| format!("Invalid backend for repository {}", repository.id))?;
    }

    println!("{}", style("Configuration OK").green().bold());
    println!();
    println!("  Default backend: {}", style(&config.backend.default).cyan());
    println!(
        "  State dir: {}",
        style(config.persistence.state_dir().display()).dim()
    );
    render::repository_list(&config.repositories);
    Ok(())
}

fn diff_config(current: &Config, other: &Path, json: bool) -> anyhow::Result<()> {
    let other = ConfigManager::load_from_path(other)
        .with_context(|| format!("Failed to load {}", other.display()))?;
    let diff = diff_repositories(&current.repositories, &other.repositories);

    if json {
        println!("{}", serde_json::to_string_pretty(&diff)?);
    } else {
        render::repository_diff(&diff);
    }
    Ok(())
}
