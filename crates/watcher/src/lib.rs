//! File system change watching
//!
//! Watches a file or directory, optionally recursively, and reports
//! creations, modifications, deletions and moves through a callback (or an
//! async [`ChangeStream`]). The watched path does not need to exist: the
//! ancestor chain is watched so the target is picked up when it appears, and
//! deleting or moving it away is reported rather than breaking the watch.
//!
//! This crate provides:
//! - One event model over inotify, FSEvents, ReadDirectoryChangesW and polling
//! - Recursive watches built from per-directory native watches
//! - Move correlation (source and destination in one change)
//! - Process-wide accounting of native watches, with a test override
//! - Gitignore-style exclusion of subtrees

pub mod backend;
pub mod change;
pub mod config;
pub mod error;
pub mod filter;
pub mod limits;
pub mod service;
pub mod stream;
pub mod watcher;

mod classifier;
mod registry;
mod tree;

pub use change::{ChangeInfo, ChangeType, FilePathType};
pub use config::{BackendKind, WatcherConfig};
pub use error::{BackendError, ConfigError, WatchError};
pub use service::WatchService;
pub use stream::ChangeStream;
pub use watcher::{FilePathWatcher, WatchOptions, WatchType};

/// Whether recursive watches can be established with the process-wide
/// service's backend.
///
/// Answered without starting the service: if no watcher holds it, the
/// backend it would start with decides.
pub fn recursive_watch_available() -> bool {
    match WatchService::shared_if_running() {
        Some(service) => service.recursive_watch_available(),
        None => WatcherConfig::default().backend.supports_recursive(),
    }
}
