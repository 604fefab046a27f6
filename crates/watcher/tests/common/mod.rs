//! Common utilities for integration tests

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver};
use pathwatch::{ChangeInfo, ChangeType, FilePathWatcher, WatchOptions, WatchService, WatcherConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Generous: CI machines can be slow to deliver inotify events
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// How long "nothing else arrives" is checked for
pub const QUIET: Duration = Duration::from_millis(500);

/// One callback invocation
#[derive(Debug, Clone)]
pub struct Record {
    pub change: ChangeInfo,
    pub path: PathBuf,
    pub error: bool,
}

impl Record {
    pub fn is(&self, change_type: ChangeType, path: &Path) -> bool {
        !self.error && self.change.change_type == change_type && self.change.path() == path
    }
}

/// Temp directory with its canonical path (macOS puts temp dirs behind /var -> /private/var)
pub struct Workspace {
    _temp: TempDir,
    pub root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let root = temp.path().canonicalize().expect("canonicalize temp dir");
        Self { _temp: temp, root }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// A watcher on its own service, recording every callback
pub struct Recorder {
    pub watcher: FilePathWatcher,
    pub records: Receiver<Record>,
    seen: Vec<Record>,
}

impl Recorder {
    pub fn start(path: &Path, options: &WatchOptions) -> Self {
        let service = WatchService::start(WatcherConfig::default()).expect("start watch service");
        Self::start_on(FilePathWatcher::with_service(service), path, options)
    }

    pub fn start_on(mut watcher: FilePathWatcher, path: &Path, options: &WatchOptions) -> Self {
        let (tx, rx) = unbounded();
        watcher
            .watch_with_change_info(path, options, move |change, path, error| {
                let _ = tx.send(Record {
                    change: change.clone(),
                    path: path.to_path_buf(),
                    error,
                });
            })
            .expect("watch");
        watcher.wait_until_ready().expect("watch setup");

        Self {
            watcher,
            records: rx,
            seen: Vec::new(),
        }
    }

    /// Wait until a record satisfying `pred` arrives; everything received
    /// on the way is kept in [`seen`](Self::seen)
    pub fn wait_for(&mut self, mut pred: impl FnMut(&Record) -> bool) -> Option<Record> {
        if let Some(found) = self.seen.iter().find(|r| pred(r)) {
            return Some(found.clone());
        }

        let deadline = Instant::now() + TIMEOUT;
        while let Ok(record) = self.records.recv_deadline(deadline) {
            self.seen.push(record.clone());
            if pred(&record) {
                return Some(record);
            }
        }
        None
    }

    pub fn wait_change(&mut self, change_type: ChangeType, path: &Path) -> bool {
        self.wait_for(|r| r.is(change_type, path)).is_some()
    }

    /// Collect whatever arrives within `window`
    pub fn drain(&mut self, window: Duration) -> Vec<Record> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        while let Ok(record) = self.records.recv_deadline(deadline) {
            self.seen.push(record.clone());
            out.push(record);
        }
        out
    }

    pub fn seen(&self) -> &[Record] {
        &self.seen
    }

    /// Index in [`seen`](Self::seen) of the first record matching
    pub fn position(&self, change_type: ChangeType, path: &Path) -> Option<usize> {
        self.seen.iter().position(|r| r.is(change_type, path))
    }
}

pub fn recursive() -> WatchOptions {
    WatchOptions {
        report_modified_path: true,
        ..WatchOptions::recursive()
    }
}

pub fn non_recursive() -> WatchOptions {
    WatchOptions {
        report_modified_path: true,
        ..Default::default()
    }
}
