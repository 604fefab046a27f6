//! Public watcher API
//!
//! A [`FilePathWatcher`] watches one path. Its callback runs on a delivery
//! thread owned by the watcher, one call at a time and in the order the
//! changes were observed:
//!
//! ```no_run
//! use pathwatch::{FilePathWatcher, WatchOptions};
//!
//! let mut watcher = FilePathWatcher::new();
//! watcher.watch_with_change_info("/etc/hosts", &WatchOptions::default(), |change, _path, error| {
//!     if error {
//!         eprintln!("watch failed");
//!     } else {
//!         println!("{}", change);
//!     }
//! })?;
//! # Ok::<(), pathwatch::WatchError>(())
//! ```
//!
//! Dropping the watcher (or calling [`FilePathWatcher::stop`]) removes every
//! native watch before returning and guarantees no further callbacks. Both
//! are safe from inside the callback.

use crate::change::ChangeInfo;
use crate::error::WatchError;
use crate::filter::PathFilter;
use crate::service::{Delivery, WatchId, WatchService};
use crate::tree::WatchRequest;
use crossbeam_channel::{unbounded, Receiver};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace, warn};

/// Whether a watch covers the subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchType {
    /// The path itself and, for a directory, its direct children
    #[default]
    NonRecursive,
    /// The path and everything below it
    Recursive,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub watch_type: WatchType,

    /// Report the path that changed instead of the watched path
    pub report_modified_path: bool,

    /// Gitignore-style patterns, relative to the watched path
    pub excludes: Vec<String>,

    /// File of gitignore-style patterns
    pub exclude_file: Option<PathBuf>,
}

impl WatchOptions {
    pub fn recursive() -> Self {
        Self {
            watch_type: WatchType::Recursive,
            ..Default::default()
        }
    }

    pub fn is_recursive(&self) -> bool {
        self.watch_type == WatchType::Recursive
    }
}

/// Internal callback shape all public forms are adapted to
pub(crate) type Callback = Box<dyn FnMut(Result<&ChangeInfo, &WatchError>) + Send>;

struct ActiveWatch {
    id: WatchId,
    target: PathBuf,
    /// The delivery thread only runs callbacks while this is alive
    guard: Arc<()>,
    delivery: Option<JoinHandle<()>>,
    delivery_thread: ThreadId,
}

pub struct FilePathWatcher {
    service: Option<Arc<WatchService>>,
    active: Option<ActiveWatch>,
}

impl Default for FilePathWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FilePathWatcher {
    /// Watcher on the process-wide service (started on first watch)
    pub fn new() -> Self {
        Self {
            service: None,
            active: None,
        }
    }

    /// Watcher on a dedicated service
    pub fn with_service(service: Arc<WatchService>) -> Self {
        Self {
            service: Some(service),
            active: None,
        }
    }

    /// Watch `path`; the callback gets `(path, error)`.
    ///
    /// The reported path is always the watched path.
    pub fn watch<F>(&mut self, path: impl AsRef<Path>, recursive: bool, mut callback: F) -> Result<(), WatchError>
    where
        F: FnMut(&Path, bool) + Send + 'static,
    {
        let options = WatchOptions {
            watch_type: if recursive {
                WatchType::Recursive
            } else {
                WatchType::NonRecursive
            },
            ..Default::default()
        };
        self.watch_with_change_info(path, &options, move |_, path, error| callback(path, error))
    }

    /// Watch `path` with `options`; the callback gets `(path, error)`
    pub fn watch_with_options<F>(
        &mut self,
        path: impl AsRef<Path>,
        options: &WatchOptions,
        mut callback: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&Path, bool) + Send + 'static,
    {
        self.watch_with_change_info(path, options, move |_, path, error| callback(path, error))
    }

    /// Watch `path` with `options`; the callback gets the full change plus
    /// `(path, error)`.
    ///
    /// Returns once the request is validated and queued. A failure that
    /// happens later (native watch limit reached) arrives as one callback
    /// with `error == true`, after which the callback is never called again.
    pub fn watch_with_change_info<F>(
        &mut self,
        path: impl AsRef<Path>,
        options: &WatchOptions,
        mut callback: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(&ChangeInfo, &Path, bool) + Send + 'static,
    {
        let report_modified_path = options.report_modified_path;
        self.install(path.as_ref(), options, move |root| {
            let root = root.to_path_buf();
            let adapted: Callback = Box::new(move |delivery: Result<&ChangeInfo, &WatchError>| match delivery {
                Ok(change) => {
                    let reported = if report_modified_path {
                        change.path()
                    } else {
                        root.as_path()
                    };
                    callback(change, reported, false);
                }
                Err(_) => {
                    let unknown = ChangeInfo::unknown(root.clone());
                    callback(&unknown, &root, true);
                }
            });
            adapted
        })
    }

    /// Validate, then queue the watch with a callback built for the
    /// normalized target
    pub(crate) fn install<M>(&mut self, path: &Path, options: &WatchOptions, make_callback: M) -> Result<(), WatchError>
    where
        M: FnOnce(&Path) -> Callback,
    {
        if let Some(active) = &self.active {
            return Err(WatchError::AlreadyWatching(active.target.clone()));
        }
        if path.as_os_str().is_empty() {
            return Err(WatchError::BadConfiguration("empty path".to_string()));
        }

        let service = self.service()?;
        if options.is_recursive() && !service.recursive_watch_available() {
            return Err(WatchError::Unsupported {
                backend: service.backend_name(),
            });
        }

        let target = normalize(path)?;
        let filter = PathFilter::new(&target, &options.excludes, options.exclude_file.as_deref())?;
        let request = WatchRequest {
            target: target.clone(),
            recursive: options.is_recursive(),
            report_modified_path: options.report_modified_path,
            filter,
        };

        let callback = make_callback(&target);
        let (tx, rx) = unbounded();
        let guard = Arc::new(());
        let delivery = spawn_delivery(&target, rx, Arc::downgrade(&guard), callback)?;
        let delivery_thread = delivery.thread().id();

        let id = service.add(request, tx)?;
        debug!("Watch {} queued for {}", id, target.display());

        self.active = Some(ActiveWatch {
            id,
            target,
            guard,
            delivery: Some(delivery),
            delivery_thread,
        });
        Ok(())
    }

    /// The watched path, normalized, while a watch is active
    pub fn target(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.target.as_path())
    }

    pub fn is_watching(&self) -> bool {
        self.active.is_some()
    }

    /// Block until the watch's native watches are in place.
    ///
    /// Changes made before this returns may or may not be reported.
    pub fn wait_until_ready(&self) -> Result<(), WatchError> {
        match &self.service {
            Some(service) if self.active.is_some() => service.sync(),
            _ => Ok(()),
        }
    }

    /// Stop watching and release every native watch.
    ///
    /// No callback starts after this returns. Calling it from inside the
    /// callback is allowed; the in-progress callback simply finishes.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        // Pending deliveries are dropped from here on
        drop(active.guard);

        if let Some(service) = &self.service {
            service.remove(active.id);
        }

        if let Some(delivery) = active.delivery.take() {
            if thread::current().id() == active.delivery_thread {
                // Stopped from our own callback: the thread exits once it returns
                trace!("Watch {} stopped from its callback", active.id);
            } else if delivery.join().is_err() {
                warn!("Delivery thread for {} panicked", active.target.display());
            }
        }

        debug!("Stopped watching {}", active.target.display());
    }

    fn service(&mut self) -> Result<Arc<WatchService>, WatchError> {
        if let Some(service) = &self.service {
            return Ok(service.clone());
        }
        let service = WatchService::shared()?;
        self.service = Some(service.clone());
        Ok(service)
    }
}

impl Drop for FilePathWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_delivery(
    target: &Path,
    deliveries: Receiver<Delivery>,
    guard: Weak<()>,
    mut callback: Callback,
) -> Result<JoinHandle<()>, WatchError> {
    thread::Builder::new()
        .name("pathwatch-delivery".to_string())
        .spawn(move || {
            for delivery in deliveries.iter() {
                // Upgrade fails once the watcher is stopped
                let Some(_alive) = guard.upgrade() else {
                    break;
                };
                match delivery {
                    Delivery::Change(change) => callback(Ok(&change)),
                    Delivery::Failed(err) => {
                        warn!("Watch failed: {}", err);
                        callback(Err(&err));
                        break;
                    }
                }
            }
        })
        .map_err(|e| WatchError::Backend {
            backend: "delivery",
            message: format!("failed to spawn delivery thread for {}: {}", target.display(), e),
        })
}

/// Absolute, lexically clean path with the existing part of its parent
/// chain resolved through symlinks.
///
/// The last component is left alone so that a symlinked target is watched
/// as the link, not as its destination.
fn normalize(path: &Path) -> Result<PathBuf, WatchError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| WatchError::BadConfiguration(format!("no current directory: {}", e)))?
            .join(path)
    };
    let clean = clean(&absolute);

    let (Some(parent), Some(name)) = (clean.parent(), clean.file_name()) else {
        // Filesystem root
        return Ok(clean);
    };

    // Canonicalize the deepest existing ancestor, keep the rest as written
    let mut existing = parent;
    let mut rest = Vec::new();
    loop {
        if let Ok(resolved) = existing.canonicalize() {
            let mut out = resolved;
            out.extend(rest.iter().rev());
            out.push(name);
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(up), Some(component)) => {
                rest.push(component.to_os_string());
                existing = up;
            }
            _ => return Ok(clean),
        }
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if !matches!(out.components().next_back(), Some(Component::RootDir | Component::Prefix(_)) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
