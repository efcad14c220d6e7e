//! # Chorus Server
//!
//! Runs the command scheduler, recurring tasks and health checks for a
//! Chorus music library until interrupted.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::Context;
use chorus_core::commands::{
    CommandFilter, CommandRecord, CommandStatus, CommandStore, SqliteCommandStore,
};
use chorus_core::{events::EventBus, health::checks::LocalDiskProbe};
use chorus_server::infra::{
    app_context::{AppContext, start_health},
    config::{Config, ConfigLoad, ConfigLoader},
    telemetry,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "chorus-server")]
#[command(about = "Background command and health engine for a Chorus music library")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ConfigArgs {
    /// Path to chorus.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Directory holding the command database (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Maximum number of commands running at once (overrides config)
    #[arg(long)]
    max_concurrency: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engines until Ctrl-C (default)
    Run,
    /// Print persisted command history as JSON lines, most recent first
    History {
        /// Maximum number of commands to print
        #[arg(long)]
        limit: Option<usize>,
        /// Only commands in this state (queued, started, completed, failed,
        /// aborted); repeatable
        #[arg(long = "status", value_parser = parse_status)]
        statuses: Vec<CommandStatus>,
        /// Only commands with this name
        #[arg(long)]
        name: Option<String>,
    },
    /// Evaluate every health check once and print the results
    Health,
}

fn parse_status(raw: &str) -> Result<CommandStatus, String> {
    CommandStatus::from_str(raw).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_server(config).await,
        Command::History {
            limit,
            statuses,
            name,
        } => {
            let mut filter = CommandFilter::all();
            for status in statuses {
                filter = filter.with_status(status);
            }
            if let Some(name) = name {
                filter = filter.named(name);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            print_history(&config, &filter).await
        }
        Command::Health => print_health(&config).await,
    }
}

fn load_runtime_config(args: &ConfigArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(data_dir) = &args.data_dir {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("failed to create data directory {}", data_dir.display())
        })?;
        config.data_dir = data_dir.clone();
    }
    if let Some(max) = args.max_concurrency {
        config.engine.commands.max_concurrency = max;
    }

    telemetry::init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let commands = &config.engine.commands;
    info!(
        data_dir = %config.data_dir.display(),
        commands.max_concurrency = commands.max_concurrency,
        commands.max_history = commands.max_history,
        commands.require_persistence = commands.require_persistence,
        health.debounce_window_ms = config.engine.health.debounce_window_ms,
        health.sweep_interval_secs = config.engine.health.sweep_interval_secs,
        "configuration in effect"
    );

    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let context = AppContext::start(config).await?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    context.shutdown().await;
    Ok(())
}

async fn print_history(config: &Config, filter: &CommandFilter) -> anyhow::Result<()> {
    let path = config.database_path();
    let store = SqliteCommandStore::open(&path)
        .await
        .with_context(|| format!("failed to open command store at {}", path.display()))?;
    let mut records: Vec<CommandRecord> = store
        .load_all()
        .await
        .context("failed to read command history")?
        .into_iter()
        .filter(|record| filter.matches(record))
        .collect();
    store.close().await;

    records.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
    if let Some(limit) = filter.limit {
        records.truncate(limit);
    }
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

async fn print_health(config: &Config) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.engine.health.evaluate_on_startup = false;
    config.engine.health.sweep_interval_secs = 0;

    let events = EventBus::new(&config.engine.events);
    let (_catalog, health) =
        start_health(&config, &events, Arc::new(LocalDiskProbe)).await?;
    let results = health.evaluate_all().await;
    health.shutdown().await;

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }
    info!(overall = %health.overall_severity(), checks = results.len(), "health evaluated");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
