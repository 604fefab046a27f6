//! Native watch backends
//!
//! A backend registers one watch per directory and forwards raw events,
//! tagged with the handle of the directory they were observed in. It does
//! no classification: that is left to the watch tree and the classifier.

pub mod native;

#[cfg(test)]
pub(crate) mod fake;

use crate::config::{BackendKind, WatcherConfig};
use crate::error::BackendError;
use crossbeam_channel::Sender;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;

pub use native::NotifyBackend;

/// Opaque identifier of one native directory watch
///
/// Values are never reused within a backend, so an event carrying the
/// handle of a removed watch can always be told apart from one for a new
/// watch at the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeHandle(pub(crate) u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backend-level event codes, before any semantic classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    Create,
    Write,
    CloseWrite,
    Attrib,
    Delete,
    /// The watched directory itself was deleted
    DeleteSelf,
    MoveFrom,
    MoveTo,
    /// The watched directory itself was moved away
    MoveSelf,
    /// The backend lost events; state must be rescanned
    Overflow,
}

impl RawEventKind {
    /// Kinds after which the path no longer exists at its old location
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            RawEventKind::Delete
                | RawEventKind::DeleteSelf
                | RawEventKind::MoveFrom
                | RawEventKind::MoveSelf
        )
    }

    /// Kinds after which a new object exists at the path
    pub fn is_arrival(self) -> bool {
        matches!(self, RawEventKind::Create | RawEventKind::MoveTo)
    }
}

/// One event as produced by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Directory watch the event was observed on; `None` for events that
    /// concern the whole backend (overflow)
    pub handle: Option<NativeHandle>,
    pub kind: RawEventKind,
    /// Child entry name; `None` when the event is about the directory itself
    pub name: Option<OsString>,
    /// Correlates the two halves of a move, when the backend knows it
    pub cookie: Option<usize>,
    /// Whether the subject is a directory, when the backend knows it
    pub is_dir: Option<bool>,
}

impl RawEvent {
    pub fn child(handle: NativeHandle, kind: RawEventKind, name: impl Into<OsString>) -> Self {
        Self {
            handle: Some(handle),
            kind,
            name: Some(name.into()),
            cookie: None,
            is_dir: None,
        }
    }

    pub fn directory(handle: NativeHandle, kind: RawEventKind) -> Self {
        Self {
            handle: Some(handle),
            kind,
            name: None,
            cookie: None,
            is_dir: Some(true),
        }
    }

    pub fn overflow() -> Self {
        Self {
            handle: None,
            kind: RawEventKind::Overflow,
            name: None,
            cookie: None,
            is_dir: None,
        }
    }

    pub fn with_cookie(mut self, cookie: usize) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn with_dir_hint(mut self, is_dir: bool) -> Self {
        self.is_dir = Some(is_dir);
        self
    }
}

/// Where backends push raw events
pub type EventSink = Sender<RawEvent>;

/// What a backend can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Recursive watches can be provided (natively or by per-directory emulation)
    pub recursive: bool,
    /// Move halves carry a cookie
    pub correlates_moves: bool,
}

/// One OS notification primitive
pub trait NativeWatchBackend: Send {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Start watching one directory (non-recursively)
    fn register(&mut self, directory: &Path) -> Result<NativeHandle, BackendError>;

    /// Stop watching; unknown or already-dead handles are ignored
    fn unregister(&mut self, handle: NativeHandle);
}

/// Build the backend selected by `config`
pub fn from_config(
    config: &WatcherConfig,
    sink: EventSink,
) -> Result<Box<dyn NativeWatchBackend>, BackendError> {
    match config.backend {
        BackendKind::Native => Ok(Box::new(NotifyBackend::native(sink)?)),
        BackendKind::Poll => Ok(Box::new(NotifyBackend::polling(sink, config.poll_interval())?)),
    }
}

/// Make sure `directory` exists and is a directory before handing it to a backend
pub(crate) fn check_directory(directory: &Path) -> Result<(), BackendError> {
    match std::fs::metadata(directory) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(BackendError::NotFound(directory.to_path_buf())),
        Err(e) => Err(BackendError::from_io(directory.to_path_buf(), e)),
    }
}
