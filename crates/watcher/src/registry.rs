//! Reference-counted native registrations
//!
//! Several watch trees can need the same directory (two watchers under one
//! root, or every watcher's chain through `/`). The registry gives them one
//! shared native watch and only unregisters it when the last tree lets go.
//! It is also where the process-wide watch budget is charged.

use crate::backend::{NativeHandle, NativeWatchBackend};
use crate::error::BackendError;
use crate::limits;
use ahash::AHashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

struct Registration {
    path: PathBuf,
    refs: usize,
}

pub(crate) struct Registry {
    backend: Box<dyn NativeWatchBackend>,
    by_path: AHashMap<PathBuf, NativeHandle>,
    entries: AHashMap<NativeHandle, Registration>,
}

impl Registry {
    pub(crate) fn new(backend: Box<dyn NativeWatchBackend>) -> Self {
        Self {
            backend,
            by_path: AHashMap::new(),
            entries: AHashMap::new(),
        }
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Take a reference on the watch for `directory`, registering it if needed
    pub(crate) fn acquire(&mut self, directory: &Path) -> Result<NativeHandle, BackendError> {
        if let Some(&handle) = self.by_path.get(directory) {
            if let Some(entry) = self.entries.get_mut(&handle) {
                entry.refs += 1;
                trace!("Shared watch {} on {} (refs={})", handle, directory.display(), entry.refs);
                return Ok(handle);
            }
        }

        if !limits::try_reserve() {
            warn!(
                "Native watch budget exhausted ({} live) at {}",
                limits::live_watches(),
                directory.display()
            );
            return Err(BackendError::ResourceExhausted(directory.to_path_buf()));
        }

        match self.backend.register(directory) {
            Ok(handle) => {
                self.by_path.insert(directory.to_path_buf(), handle);
                self.entries.insert(
                    handle,
                    Registration {
                        path: directory.to_path_buf(),
                        refs: 1,
                    },
                );
                Ok(handle)
            }
            Err(e) => {
                limits::release();
                Err(e)
            }
        }
    }

    /// Drop a reference taken by [`acquire`](Self::acquire)
    pub(crate) fn release(&mut self, handle: NativeHandle) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            trace!("Release of unknown handle {}", handle);
            return;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }

        if let Some(entry) = self.entries.remove(&handle) {
            if self.by_path.get(&entry.path) == Some(&handle) {
                self.by_path.remove(&entry.path);
            }
            self.backend.unregister(handle);
            limits::release();
            debug!("Released native watch {} on {}", handle, entry.path.display());
        }
    }

    #[cfg(test)]
    pub(crate) fn path_of(&self, handle: NativeHandle) -> Option<&Path> {
        self.entries.get(&handle).map(|e| e.path.as_path())
    }

    pub(crate) fn live_count(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (handle, _) in self.entries.drain() {
            self.backend.unregister(handle);
            limits::release();
        }
        self.by_path.clear();
    }
}
