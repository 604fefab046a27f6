//! Backend built on the notify crate
//!
//! Each registered directory is a separate non-recursive notify watch, so on
//! Linux it costs exactly one inotify watch descriptor. notify reports full
//! paths; they are mapped back to the handle of the directory they belong to
//! through an index shared with notify's event thread.

use super::{
    check_directory, Capabilities, EventSink, NativeHandle, NativeWatchBackend, RawEvent,
    RawEventKind,
};
use crate::error::BackendError;
use ahash::AHashMap;
use dashmap::DashMap;
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use smallvec::SmallVec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Directory path -> handle, readable from notify's thread
type DirIndex = Arc<DashMap<PathBuf, NativeHandle>>;

/// [`NativeWatchBackend`] over any notify watcher
pub struct NotifyBackend<W: Watcher> {
    watcher: W,
    name: &'static str,
    capabilities: Capabilities,
    index: DirIndex,
    paths: AHashMap<NativeHandle, PathBuf>,
    next_handle: u64,
}

impl NotifyBackend<RecommendedWatcher> {
    /// The platform's notification API
    pub fn native(sink: EventSink) -> Result<Self, BackendError> {
        let index = DirIndex::default();
        let dialect = if cfg!(any(target_os = "linux", target_os = "android")) {
            Dialect::Inotify
        } else {
            Dialect::Plain
        };
        let watcher = RecommendedWatcher::new(event_handler(index.clone(), sink, dialect), Config::default())
            .map_err(|e| BackendError::from_notify(PathBuf::new(), e))?;

        Ok(Self::with_watcher(
            watcher,
            "native",
            Capabilities {
                recursive: true,
                // inotify is the only notify backend that exposes move cookies
                correlates_moves: cfg!(any(target_os = "linux", target_os = "android")),
            },
            index,
        ))
    }
}

impl NotifyBackend<PollWatcher> {
    /// Polling fallback, for filesystems without change notifications
    pub fn polling(sink: EventSink, interval: Duration) -> Result<Self, BackendError> {
        let index = DirIndex::default();
        let config = Config::default().with_poll_interval(interval);
        let watcher = PollWatcher::new(event_handler(index.clone(), sink, Dialect::Plain), config)
            .map_err(|e| BackendError::from_notify(PathBuf::new(), e))?;

        Ok(Self::with_watcher(
            watcher,
            "poll",
            Capabilities {
                recursive: true,
                correlates_moves: false,
            },
            index,
        ))
    }
}

impl<W: Watcher> NotifyBackend<W> {
    fn with_watcher(watcher: W, name: &'static str, capabilities: Capabilities, index: DirIndex) -> Self {
        Self {
            watcher,
            name,
            capabilities,
            index,
            paths: AHashMap::new(),
            next_handle: 1,
        }
    }
}

impl<W: Watcher + Send> NativeWatchBackend for NotifyBackend<W> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn register(&mut self, directory: &Path) -> Result<NativeHandle, BackendError> {
        check_directory(directory)?;

        let handle = NativeHandle(self.next_handle);
        self.next_handle += 1;

        // Index first: events can arrive as soon as the watch exists
        self.index.insert(directory.to_path_buf(), handle);

        if let Err(e) = self.watcher.watch(directory, RecursiveMode::NonRecursive) {
            self.index.remove_if(directory, |_, h| *h == handle);
            return Err(BackendError::from_notify(directory.to_path_buf(), e));
        }

        self.paths.insert(handle, directory.to_path_buf());
        debug!("{} backend watching {} as {}", self.name, directory.display(), handle);
        Ok(handle)
    }

    fn unregister(&mut self, handle: NativeHandle) {
        let Some(path) = self.paths.remove(&handle) else {
            trace!("Ignoring unregister of unknown handle {}", handle);
            return;
        };

        self.index.remove_if(&path, |_, h| *h == handle);

        // notify drops watches of deleted directories on its own
        if let Err(e) = self.watcher.unwatch(&path) {
            trace!("unwatch {} ({}): {}", path.display(), handle, e);
        }
        debug!("{} backend released {} ({})", self.name, path.display(), handle);
    }
}

/// How a notify watcher reports events about a watched directory itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// `DELETE_SELF` arrives as a file removal and `MOVE_SELF` as a rename
    /// source without a tracker
    Inotify,
    /// Removals and renames always describe a child of a watched directory
    Plain,
}

fn event_handler(
    index: DirIndex,
    sink: EventSink,
    dialect: Dialect,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result| {
        let events = match result {
            Ok(event) => translate(&index, &event, dialect),
            Err(e) => {
                // Whatever was lost, the trees have to rescan
                warn!("Native watcher error, requesting rescan: {}", e);
                let mut events = SmallVec::new();
                events.push(RawEvent::overflow());
                events
            }
        };

        for raw in events {
            if sink.send(raw).is_err() {
                trace!("Event sink closed, dropping native events");
                return;
            }
        }
    }
}

/// Turn one notify event into raw events attributed to watched directories
pub(crate) fn translate(
    index: &DashMap<PathBuf, NativeHandle>,
    event: &Event,
    dialect: Dialect,
) -> SmallVec<[RawEvent; 2]> {
    let mut out = SmallVec::new();

    if event.need_rescan() {
        out.push(RawEvent::overflow());
        return out;
    }

    let tracker = event.attrs.tracker();

    match event.kind {
        EventKind::Create(kind) => {
            let hint = match kind {
                CreateKind::Folder => Some(true),
                CreateKind::File => Some(false),
                _ => None,
            };
            for path in &event.paths {
                out.extend(attribute(index, path, RawEventKind::Create, hint, None));
            }
        }
        EventKind::Remove(kind) => {
            let hint = match kind {
                RemoveKind::Folder => Some(true),
                RemoveKind::File => Some(false),
                _ => None,
            };
            for path in &event.paths {
                // inotify sets ISDIR on a directory's removal as seen from
                // its parent, never on DELETE_SELF
                let own = match dialect {
                    Dialect::Inotify if kind != RemoveKind::Folder => {
                        own_event(index, path, RawEventKind::DeleteSelf)
                    }
                    _ => None,
                };
                match own {
                    Some(raw) => out.push(raw),
                    None => out.extend(attribute(index, path, RawEventKind::Delete, hint, None)),
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                // IN_MOVED_FROM always carries a cookie, MOVE_SELF never does
                let own = match dialect {
                    Dialect::Inotify if tracker.is_none() => own_event(index, path, RawEventKind::MoveSelf),
                    _ => None,
                };
                match own {
                    Some(raw) => out.push(raw),
                    None => out.extend(attribute(index, path, RawEventKind::MoveFrom, None, tracker)),
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                out.extend(attribute(index, path, RawEventKind::MoveTo, None, tracker));
            }
        }
        // inotify repeats a completed From/To pair as Both; the halves are enough
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {}
        EventKind::Modify(ModifyKind::Name(_)) => {
            // FSEvents can't tell which side of a rename it saw
            for path in &event.paths {
                let kind = if path.symlink_metadata().is_ok() {
                    RawEventKind::MoveTo
                } else {
                    RawEventKind::MoveFrom
                };
                out.extend(attribute(index, path, kind, None, None));
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            for path in &event.paths {
                out.extend(attribute(index, path, RawEventKind::Attrib, None, None));
            }
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            for path in &event.paths {
                out.extend(attribute(index, path, RawEventKind::CloseWrite, Some(false), None));
            }
        }
        EventKind::Access(_) => {}
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            for path in &event.paths {
                out.extend(attribute(index, path, RawEventKind::Write, None, None));
            }
        }
    }

    out
}

/// Self event on the watch of `path`, if `path` is a watched directory
fn own_event(index: &DashMap<PathBuf, NativeHandle>, path: &Path, kind: RawEventKind) -> Option<RawEvent> {
    index.get(path).map(|handle| RawEvent::directory(*handle, kind))
}

/// Find the watch an event path belongs to.
///
/// Child events go to the parent directory's watch. Creations never become
/// self events: the created path may still be indexed under a stale handle.
fn attribute(
    index: &DashMap<PathBuf, NativeHandle>,
    path: &Path,
    kind: RawEventKind,
    is_dir: Option<bool>,
    cookie: Option<usize>,
) -> Option<RawEvent> {
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Some(handle) = index.get(parent) {
            let mut raw = RawEvent::child(*handle, kind, name);
            raw.is_dir = is_dir;
            raw.cookie = cookie;
            return Some(raw);
        }
    }

    let self_kind = match kind {
        RawEventKind::Delete => RawEventKind::DeleteSelf,
        RawEventKind::MoveFrom => RawEventKind::MoveSelf,
        RawEventKind::Write | RawEventKind::Attrib => kind,
        _ => {
            trace!("Unattributed {:?} event for {}", kind, path.display());
            return None;
        }
    };

    match index.get(path) {
        Some(handle) => Some(RawEvent::directory(*handle, self_kind)),
        None => {
            trace!("Unattributed {:?} event for {}", kind, path.display());
            None
        }
    }
}
