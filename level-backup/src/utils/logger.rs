//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::log_sink::BackupLog;

/// Initialize logging with the specified level.
///
/// Events that pass the filter are also captured into `backup_log`, so they
/// can be saved alongside the next backup archive.
pub fn init(level: &str, backup_log: &BackupLog) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(backup_log.layer())
        .try_init()?;

    Ok(())
}
