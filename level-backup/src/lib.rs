//! Level Backup Library
//!
//! Backup and retention engine for a live, actively edited level: consistent
//! snapshots of a dirty dataset, single-flight archiving, count and size
//! retention, and the schedulers that decide when backups run.

pub mod archive;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod dataset;
pub mod naming;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{BackupConfig, Config};
pub use orchestrator::{BackupOrchestrator, BackupRequest};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
