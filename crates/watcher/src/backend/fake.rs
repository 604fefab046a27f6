//! Deterministic backend for unit tests
//!
//! Registrations check the real filesystem (tests run against temp dirs) but
//! events are only produced when a test calls [`FakeControl::emit`].

use super::{check_directory, Capabilities, EventSink, NativeHandle, NativeWatchBackend, RawEvent, RawEventKind};
use crate::error::BackendError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    live: BTreeMap<NativeHandle, PathBuf>,
    limit: Option<usize>,
    recursive: bool,
    registrations: usize,
}

pub(crate) struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side view of a [`FakeBackend`]
#[derive(Clone)]
pub(crate) struct FakeControl {
    state: Arc<Mutex<FakeState>>,
    sink: EventSink,
}

impl FakeBackend {
    pub(crate) fn new(sink: EventSink) -> (Self, FakeControl) {
        let state = Arc::new(Mutex::new(FakeState {
            next_handle: 1,
            recursive: true,
            ..Default::default()
        }));
        (
            Self { state: state.clone() },
            FakeControl { state, sink },
        )
    }
}

impl NativeWatchBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            recursive: self.state.lock().recursive,
            correlates_moves: true,
        }
    }

    fn register(&mut self, directory: &Path) -> Result<NativeHandle, BackendError> {
        check_directory(directory)?;

        let mut state = self.state.lock();
        if let Some(limit) = state.limit {
            if state.live.len() >= limit {
                return Err(BackendError::ResourceExhausted(directory.to_path_buf()));
            }
        }

        let handle = NativeHandle(state.next_handle);
        state.next_handle += 1;
        state.registrations += 1;
        state.live.insert(handle, directory.to_path_buf());
        Ok(handle)
    }

    fn unregister(&mut self, handle: NativeHandle) {
        self.state.lock().live.remove(&handle);
    }
}

impl FakeControl {
    pub(crate) fn set_limit(&self, limit: Option<usize>) {
        self.state.lock().limit = limit;
    }

    pub(crate) fn set_recursive(&self, recursive: bool) {
        self.state.lock().recursive = recursive;
    }

    pub(crate) fn handle_for(&self, directory: &Path) -> Option<NativeHandle> {
        self.state
            .lock()
            .live
            .iter()
            .find(|(_, p)| p.as_path() == directory)
            .map(|(h, _)| *h)
    }

    pub(crate) fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = self.state.lock().live.values().cloned().collect();
        dirs.sort();
        dirs
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub(crate) fn total_registrations(&self) -> usize {
        self.state.lock().registrations
    }

    /// Raw event for `name` inside the watched `directory`
    pub(crate) fn event(&self, directory: &Path, kind: RawEventKind, name: impl Into<OsString>) -> RawEvent {
        let handle = self
            .handle_for(directory)
            .unwrap_or_else(|| panic!("{} is not watched", directory.display()));
        RawEvent::child(handle, kind, name)
    }

    pub(crate) fn emit(&self, event: RawEvent) {
        self.sink.send(event).expect("event channel closed");
    }
}
