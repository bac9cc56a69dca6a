//! Level Backup - Main entry point

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use level_backup::config::{Config, ConfigStore};
use level_backup::retention::{self, RetentionEngine};
use level_backup::utils::log_sink::BackupLog;
use level_backup::{daemon, utils, BackupRequest};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the backup daemon (default)
    Run,
    /// Take one backup now and wait for it to be written
    Backup,
    /// List existing backups, oldest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Apply retention to existing backups without writing a new one
    Prune,
    /// Print the default configuration as TOML
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);

    if let Command::InitConfig = command {
        print!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    // Load configuration
    let store = ConfigStore::load(args.config)?;

    // Initialize logging
    let backup_log = BackupLog::with_capacity(store.current().log.capture_limit);
    let log_level = args.log_level.as_deref().unwrap_or(&store.current().log.level);
    utils::logger::init(log_level, &backup_log)?;

    tracing::info!(
        "Starting level-backup v{} (dataset: {})",
        env!("CARGO_PKG_VERSION"),
        store.current().dataset.name
    );

    match command {
        Command::Run => daemon::run(store, backup_log).await,
        Command::Backup => backup_once(store.current(), &backup_log).await,
        Command::List { json } => list(store.current(), json),
        Command::Prune => prune(store.current()).await,
        Command::InitConfig => Ok(()),
    }
}

async fn backup_once(config: &Config, backup_log: &BackupLog) -> Result<()> {
    let orchestrator = daemon::build(config, backup_log, CancellationToken::new())?;
    let task = orchestrator.backup(BackupRequest::from_config(&config.backup)).await?;
    let written = task.wait().await?;

    println!("{} ({} bytes)", written.path.display(), written.size);
    for evicted in &written.evicted {
        println!("evicted {}", evicted.path.display());
    }
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let records = retention::list_backups(&config.storage.backup_dir, &config.dataset.name)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in &records {
        println!(
            "{}  {:>12}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.size,
            record.path.display()
        );
    }
    let total: u64 = records.iter().map(|r| r.size).sum();
    println!("{} backups, {} bytes", records.len(), total);
    Ok(())
}

async fn prune(config: &Config) -> Result<()> {
    let policy = config.backup.retention_policy();
    if let Some(reason) = policy.disabled_reason() {
        bail!("backups are disabled ({reason}), refusing to prune every backup");
    }

    let engine = RetentionEngine::new(config.storage.backup_dir.clone());
    let dataset = config.dataset.name.clone();
    let deleted = tokio::task::spawn_blocking(move || engine.prune(&dataset, &policy)).await?;

    for record in &deleted {
        println!("deleted {}", record.path.display());
    }
    println!("{} backups deleted", deleted.len());
    Ok(())
}
