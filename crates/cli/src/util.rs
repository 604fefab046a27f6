//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use owo_colors::OwoColorize;
use pathwatch::{ChangeInfo, ChangeType, FilePathType, WatcherConfig};
use std::fmt::Display;
use std::path::Path;

/// Config from `path`, or defaults when none was given
pub fn load_config(path: Option<&Path>) -> Result<WatcherConfig> {
    match path {
        Some(path) => WatcherConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(WatcherConfig::default()),
    }
}

/// Fixed-width change label, colored by kind
pub fn change_label(change_type: ChangeType) -> String {
    let label = format!("{:<8}", change_type.to_string());
    match change_type {
        ChangeType::Created => label.green().to_string(),
        ChangeType::Deleted => label.red().to_string(),
        ChangeType::Modified => label.yellow().to_string(),
        ChangeType::Moved => label.cyan().to_string(),
        ChangeType::Unknown => label.magenta().to_string(),
    }
}

/// "file", "dir" or "?" padded for column output
pub fn path_type_label(path_type: FilePathType) -> String {
    format!("{:<4}", path_type.to_string())
}

/// Path part of a change line. `shown` is what the user asked to see
/// (the changed path or the watched root).
pub fn describe(change: &ChangeInfo, shown: &Path) -> String {
    match &change.moved_from_path {
        Some(from) if shown == change.path() => {
            format!("{} -> {}", from.display(), shown.display())
        }
        _ => shown.display().to_string(),
    }
}

/// Wall-clock time with milliseconds
pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format("%H:%M:%S%.3f").to_string()
}

/// Native watch cap, which may be unbounded on platforms without one
pub fn format_limit(limit: usize) -> String {
    if limit == usize::MAX {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}
