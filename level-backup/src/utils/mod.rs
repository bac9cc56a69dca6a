//! Utility modules for the backup engine.

pub mod errors;
pub mod log_sink;
pub mod logger;

pub use errors::{BackupError, Result};
