//! Self-describing backup file names.
//!
//! Archives are named `backup_{dataset}_{yyyy-MM-dd_HH-mm-ss}.zip` and their
//! paired log folders `logs_{dataset}_{yyyy-MM-dd_HH-mm-ss}`. The timestamp is
//! always UTC with second precision, so the owner and creation time of a
//! backup can be recovered from the name alone. Names sort chronologically
//! within four-digit years.

use chrono::{DateTime, NaiveDateTime, Utc};

pub const ARCHIVE_PREFIX: &str = "backup_";
pub const LOGS_PREFIX: &str = "logs_";
pub const ARCHIVE_EXTENSION: &str = "zip";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
/// Width of everything after the year, `-03-09_17-05-00`. The year itself
/// is four digits, or signed and longer outside 0000-9999.
const TIMESTAMP_TAIL_LEN: usize = 15;

/// Which kind of backup artifact a name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Archive,
    Logs,
}

/// A successfully decoded backup file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedName {
    pub kind: BackupKind,
    pub dataset: String,
    pub timestamp: DateTime<Utc>,
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// `backup_{dataset}_{timestamp}.zip`
pub fn archive_name(dataset: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_PREFIX}{dataset}_{}.{ARCHIVE_EXTENSION}",
        format_timestamp(timestamp)
    )
}

/// `logs_{dataset}_{timestamp}` (a directory)
pub fn log_dir_name(dataset: &str, timestamp: &DateTime<Utc>) -> String {
    format!("{LOGS_PREFIX}{dataset}_{}", format_timestamp(timestamp))
}

/// Recover the dataset name and timestamp from a backup file or folder name.
///
/// Returns `None` for anything that is not a backup artifact. A trailing
/// extension and a trailing `/` are tolerated. Dataset names are not
/// validated, so they may contain `_`: the timestamp is the fixed-width
/// tail plus the year before it, and everything between the prefix and the
/// year's `_` is the name.
pub fn decode(file_name: &str) -> Option<DecodedName> {
    let (kind, rest) = if let Some(rest) = file_name.strip_prefix(ARCHIVE_PREFIX) {
        (BackupKind::Archive, rest)
    } else if let Some(rest) = file_name.strip_prefix(LOGS_PREFIX) {
        (BackupKind::Logs, rest)
    } else {
        return None;
    };

    let rest = rest.trim_end_matches(['/', '\\']);
    let stem = strip_extension(rest);

    let split = stem.len().checked_sub(TIMESTAMP_TAIL_LEN)?;
    let (dataset, year) = stem.get(..split)?.rsplit_once('_')?;
    if year.is_empty() {
        return None;
    }
    let raw_timestamp = stem.get(dataset.len() + 1..)?;

    let timestamp = NaiveDateTime::parse_from_str(raw_timestamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();

    Some(DecodedName {
        kind,
        dataset: dataset.to_string(),
        timestamp,
    })
}

/// Timestamps always contain `_`, so a dot inside the dataset name is never
/// mistaken for an extension.
fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && !ext.contains('_') => stem,
        _ => name,
    }
}
