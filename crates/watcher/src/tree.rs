//! The set of native watches behind one watch request
//!
//! To observe `/a/b/c` the tree watches every existing ancestor (`/`, `/a`,
//! `/a/b`), the target itself when it is a directory and, for recursive
//! requests, every directory below it. Ancestor watches are what let a watch
//! survive the target (or any of its parents) being deleted, moved, or not
//! existing yet: their create/delete events drive reconciliation.
//!
//! Directories live in a `BTreeMap` keyed by path. Paths order component by
//! component, so a directory and everything below it is one contiguous range,
//! which is how a deleted directory's descendants are dropped.

use crate::backend::{NativeHandle, RawEvent, RawEventKind};
use crate::error::{BackendError, WatchError};
use crate::filter::PathFilter;
use crate::registry::Registry;
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Immutable configuration of one watch
#[derive(Debug, Clone)]
pub(crate) struct WatchRequest {
    pub(crate) target: PathBuf,
    pub(crate) recursive: bool,
    pub(crate) report_modified_path: bool,
    pub(crate) filter: PathFilter,
}

/// A raw event translated to an absolute path inside the watch's scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedEvent {
    pub(crate) path: PathBuf,
    pub(crate) kind: RawEventKind,
    pub(crate) cookie: Option<usize>,
    pub(crate) is_dir: Option<bool>,
}

impl ResolvedEvent {
    pub(crate) fn new(path: impl Into<PathBuf>, kind: RawEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            cookie: None,
            is_dir: None,
        }
    }

    fn synthesized(path: &Path, kind: RawEventKind, is_dir: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            cookie: None,
            is_dir: Some(is_dir),
        }
    }

    pub(crate) fn with_cookie(mut self, cookie: Option<usize>) -> Self {
        self.cookie = cookie;
        self
    }

    pub(crate) fn with_dir_hint(mut self, is_dir: Option<bool>) -> Self {
        self.is_dir = is_dir;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    /// Strict ancestor of the target
    Ancestor,
    Target,
    /// Below the target, `depth` components deep
    Child { depth: usize },
    /// Destination of the symlinked target
    Linked,
    Unrelated,
}

/// Whether entries found while populating a directory are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Populate {
    /// Register watches only (initial walk, directories moved into scope)
    Silent,
    /// Also synthesize `Create` events (freshly created directories)
    Report,
}

/// Parent directory of a symlinked target's destination
#[derive(Debug)]
struct LinkWatch {
    destination: PathBuf,
    directory: PathBuf,
    handle: NativeHandle,
}

/// Registration failed because the watch budget is spent
struct Exhausted(PathBuf);

type Reconcile = Result<(), Exhausted>;

pub(crate) struct WatchTree {
    target: PathBuf,
    recursive: bool,
    filter: PathFilter,

    /// Every watched directory, ancestors included
    dirs: BTreeMap<PathBuf, NativeHandle>,
    by_handle: AHashMap<NativeHandle, PathBuf>,

    link: Option<LinkWatch>,
    target_exists: bool,
    failed: bool,
}

impl WatchTree {
    pub(crate) fn new(request: &WatchRequest) -> Self {
        Self {
            target: request.target.clone(),
            recursive: request.recursive,
            filter: request.filter.clone(),
            dirs: BTreeMap::new(),
            by_handle: AHashMap::new(),
            link: None,
            target_exists: false,
            failed: false,
        }
    }

    pub(crate) fn target(&self) -> &Path {
        &self.target
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    #[cfg(test)]
    pub(crate) fn target_exists(&self) -> bool {
        self.target_exists
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        self.dirs.len() + usize::from(self.link.is_some())
    }

    /// Register the ancestor chain, the target and (if recursive) its subtree
    pub(crate) fn initialize(&mut self, registry: &mut Registry) -> Result<(), WatchError> {
        let mut discard = Vec::new();
        let result = self.sync_chain(registry, &mut discard, Populate::Silent, false, true);
        self.check(registry, result)?;

        debug!(
            "Watching {} ({} directories, recursive={}, exists={})",
            self.target.display(),
            self.dirs.len(),
            self.recursive,
            self.target_exists
        );
        Ok(())
    }

    /// Apply one raw event, appending in-scope events to `out`.
    ///
    /// Returns whether the event's handle belongs to this tree.
    pub(crate) fn process(
        &mut self,
        registry: &mut Registry,
        event: &RawEvent,
        out: &mut Vec<ResolvedEvent>,
    ) -> Result<bool, WatchError> {
        if self.failed {
            return Ok(false);
        }

        let Some(handle) = event.handle else {
            // Backend-wide overflow concerns every watch
            let result = self.rescan(registry, out);
            self.check(registry, result)?;
            return Ok(true);
        };

        let Some(directory) = self.directory_of(handle) else {
            return Ok(false);
        };

        if event.kind == RawEventKind::Overflow {
            let result = self.rescan(registry, out);
            self.check(registry, result)?;
            return Ok(true);
        }

        let path = match &event.name {
            Some(name) => directory.join(name),
            None => directory,
        };

        let result = self.apply(registry, path, event, out);
        self.check(registry, result)?;
        Ok(true)
    }

    /// Release every native watch held by this tree
    pub(crate) fn release_all(&mut self, registry: &mut Registry) {
        for (_, handle) in std::mem::take(&mut self.dirs) {
            registry.release(handle);
        }
        self.by_handle.clear();
        if let Some(link) = self.link.take() {
            registry.release(link.handle);
        }
    }

    fn check(&mut self, registry: &mut Registry, result: Reconcile) -> Result<(), WatchError> {
        match result {
            Ok(()) => Ok(()),
            Err(Exhausted(path)) => {
                warn!(
                    "Watch on {} failed: native watch limit reached at {}",
                    self.target.display(),
                    path.display()
                );
                self.release_all(registry);
                self.failed = true;
                Err(WatchError::ResourceExhausted { path })
            }
        }
    }

    fn apply(
        &mut self,
        registry: &mut Registry,
        path: PathBuf,
        event: &RawEvent,
        out: &mut Vec<ResolvedEvent>,
    ) -> Reconcile {
        let kind = event.kind;

        match self.relation(&path) {
            Relation::Unrelated => Ok(()),

            Relation::Ancestor => {
                if kind.is_removal() {
                    trace!("Ancestor {} went away", path.display());
                    let was_dir = self.dirs.contains_key(&self.target);
                    self.drop_subtree(registry, &path);
                    self.mark_target_missing(out, was_dir);
                    self.resolve_link(registry)
                } else if kind.is_arrival() {
                    trace!("Ancestor {} appeared", path.display());
                    let populate = populate_for(kind);
                    self.sync_chain(registry, out, populate, true, false)
                } else {
                    Ok(())
                }
            }

            Relation::Target => {
                let hint = self.dir_hint(event, &path);
                if kind.is_removal() {
                    let existed = std::mem::replace(&mut self.target_exists, false);
                    let parent_reports = event.name.is_none() && self.parent_watched(&path);
                    self.drop_subtree(registry, &path);
                    if !parent_reports && (existed || event.name.is_some()) {
                        out.push(resolved(path, event, hint));
                    }
                    self.resolve_link(registry)
                } else if kind.is_arrival() {
                    out.push(resolved(path.clone(), event, hint));
                    self.target_exists = true;
                    if is_directory(&path) {
                        self.populate(registry, &path, populate_for(kind), out)?;
                    }
                    self.resolve_link(registry)
                } else {
                    out.push(resolved(path, event, hint));
                    Ok(())
                }
            }

            Relation::Child { depth } => {
                if depth > 1 && !self.recursive {
                    return Ok(());
                }

                let hint = self.dir_hint(event, &path);
                let is_dir = hint.unwrap_or_else(|| is_real_directory(&path));
                if self.filter.is_excluded(&path, is_dir) {
                    trace!("Excluded: {}", path.display());
                    return Ok(());
                }

                if kind.is_removal() {
                    // A self event repeats what the watched parent reports
                    if event.name.is_some() || !self.parent_watched(&path) {
                        out.push(resolved(path.clone(), event, hint));
                    }
                    self.drop_subtree(registry, &path);
                } else if kind.is_arrival() {
                    out.push(resolved(path.clone(), event, hint));
                    if self.recursive && is_real_directory(&path) {
                        self.populate(registry, &path, populate_for(kind), out)?;
                    }
                } else {
                    out.push(resolved(path, event, hint));
                }
                Ok(())
            }

            Relation::Linked => {
                // Writes through the link show up on the destination
                out.push(
                    ResolvedEvent::new(self.target.clone(), RawEventKind::Write)
                        .with_dir_hint(event.is_dir),
                );
                if kind.is_arrival() || kind.is_removal() {
                    self.resolve_link(registry)?;
                }
                Ok(())
            }
        }
    }

    fn relation(&self, path: &Path) -> Relation {
        if path == self.target {
            return Relation::Target;
        }
        if let Ok(rest) = path.strip_prefix(&self.target) {
            return Relation::Child {
                depth: rest.components().count(),
            };
        }
        if self.target.starts_with(path) {
            return Relation::Ancestor;
        }
        if self.link.as_ref().map_or(false, |l| l.destination == path) {
            return Relation::Linked;
        }
        Relation::Unrelated
    }

    fn directory_of(&self, handle: NativeHandle) -> Option<PathBuf> {
        if let Some(dir) = self.by_handle.get(&handle) {
            return Some(dir.clone());
        }
        self.link
            .as_ref()
            .filter(|l| l.handle == handle)
            .map(|l| l.directory.clone())
    }

    /// A path we hold a watch on is a directory, whatever the event says
    fn dir_hint(&self, event: &RawEvent, path: &Path) -> Option<bool> {
        if self.dirs.contains_key(path) {
            return Some(true);
        }
        event.is_dir
    }

    fn parent_watched(&self, path: &Path) -> bool {
        path.parent().map_or(false, |parent| self.dirs.contains_key(parent))
    }

    /// Walk from the root down to the target, registering what exists and
    /// dropping what doesn't.
    ///
    /// `announce` pushes a `Create` for the target when it turns up;
    /// `walk` re-walks the target's subtree even if it was already there.
    fn sync_chain(
        &mut self,
        registry: &mut Registry,
        out: &mut Vec<ResolvedEvent>,
        populate: Populate,
        announce: bool,
        walk: bool,
    ) -> Reconcile {
        let target = self.target.clone();
        let mut chain: Vec<&Path> = target.ancestors().skip(1).filter(|p| p.has_root()).collect();
        chain.reverse();

        for dir in chain {
            if !is_directory(dir) || !self.ensure(registry, dir)? {
                // Everything from here down is gone
                let was_dir = self.dirs.contains_key(&target);
                self.drop_subtree(registry, dir);
                self.mark_target_missing(out, was_dir);
                return self.resolve_link(registry);
            }
        }

        let existed = self.target_exists;
        match fs::metadata(&target) {
            Ok(meta) => {
                self.target_exists = true;
                if !existed && announce {
                    out.push(ResolvedEvent::synthesized(&target, RawEventKind::Create, meta.is_dir()));
                }

                if meta.is_dir() {
                    if !existed || walk {
                        let populate = if existed { Populate::Silent } else { populate };
                        self.populate(registry, &target, populate, out)?;
                    } else {
                        self.ensure(registry, &target)?;
                    }
                } else if self.dirs.contains_key(&target) {
                    // A directory was replaced by a file
                    self.drop_subtree(registry, &target);
                }
            }
            Err(_) => {
                let was_dir = self.dirs.contains_key(&target);
                self.drop_subtree(registry, &target);
                self.mark_target_missing(out, was_dir);
            }
        }

        self.resolve_link(registry)
    }

    /// Register `root` and, depending on the request, its contents.
    ///
    /// Each directory is registered before its entries are listed, so
    /// anything created after the listing is reported by the new watch and
    /// anything created before it is found by the listing.
    fn populate(
        &mut self,
        registry: &mut Registry,
        root: &Path,
        populate: Populate,
        out: &mut Vec<ResolvedEvent>,
    ) -> Reconcile {
        if !self.recursive && populate == Populate::Silent {
            self.ensure(registry, root)?;
            return Ok(());
        }

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(max_depth)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Raced with a deletion, or unreadable
                    trace!("Skipping entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            let path = entry.path();
            let is_dir = entry.file_type().is_dir();

            if entry.depth() > 0 {
                if self.filter.is_excluded(path, is_dir) {
                    if is_dir {
                        walker.skip_current_dir();
                    }
                    continue;
                }
                if populate == Populate::Report {
                    out.push(ResolvedEvent::synthesized(path, RawEventKind::Create, is_dir));
                }
            }

            if is_dir && (self.recursive || entry.depth() == 0) && !self.ensure(registry, path)? {
                walker.skip_current_dir();
            }
        }

        Ok(())
    }

    /// Watch `dir` unless already watched. Ok(false) when it can't be
    /// watched (vanished, permission denied).
    fn ensure(&mut self, registry: &mut Registry, dir: &Path) -> Result<bool, Exhausted> {
        if self.dirs.contains_key(dir) {
            return Ok(true);
        }

        match registry.acquire(dir) {
            Ok(handle) => {
                self.dirs.insert(dir.to_path_buf(), handle);
                self.by_handle.insert(handle, dir.to_path_buf());
                Ok(true)
            }
            Err(BackendError::ResourceExhausted(path)) => Err(Exhausted(path)),
            Err(e) if e.is_not_found() => {
                trace!("{} vanished before it could be watched", dir.display());
                Ok(false)
            }
            Err(e) => {
                warn!("Cannot watch {}: {}", dir.display(), e);
                Ok(false)
            }
        }
    }

    /// Forget `root` and every watched directory below it
    fn drop_subtree(&mut self, registry: &mut Registry, root: &Path) {
        let doomed: Vec<PathBuf> = self
            .dirs
            .range::<Path, _>((Bound::Included(root), Bound::Unbounded))
            .take_while(|(dir, _)| dir.starts_with(root))
            .map(|(dir, _)| dir.clone())
            .collect();

        for dir in doomed {
            if let Some(handle) = self.dirs.remove(&dir) {
                self.by_handle.remove(&handle);
                registry.release(handle);
                trace!("Dropped watch on {}", dir.display());
            }
        }
    }

    fn mark_target_missing(&mut self, out: &mut Vec<ResolvedEvent>, was_dir: bool) {
        if std::mem::replace(&mut self.target_exists, false) {
            out.push(
                ResolvedEvent::new(self.target.clone(), RawEventKind::Delete)
                    .with_dir_hint(was_dir.then_some(true)),
            );
        }
    }

    /// Keep the destination of a symlinked target watched
    fn resolve_link(&mut self, registry: &mut Registry) -> Reconcile {
        let destination = match fs::symlink_metadata(&self.target) {
            Ok(meta) if meta.file_type().is_symlink() => fs::canonicalize(&self.target).ok(),
            _ => None,
        };

        let unchanged = match (&self.link, &destination) {
            (Some(link), Some(dest)) => &link.destination == dest,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        if let Some(old) = self.link.take() {
            registry.release(old.handle);
        }

        let Some(destination) = destination else {
            return Ok(());
        };
        let Some(directory) = destination.parent().map(Path::to_path_buf) else {
            return Ok(());
        };

        match registry.acquire(&directory) {
            Ok(handle) => {
                debug!(
                    "{} links to {}, watching {}",
                    self.target.display(),
                    destination.display(),
                    directory.display()
                );
                self.link = Some(LinkWatch {
                    destination,
                    directory,
                    handle,
                });
                Ok(())
            }
            Err(BackendError::ResourceExhausted(path)) => Err(Exhausted(path)),
            Err(e) => {
                debug!("Cannot watch link destination {}: {}", directory.display(), e);
                Ok(())
            }
        }
    }

    /// After lost events: forget vanished directories, pick up new ones
    fn rescan(&mut self, registry: &mut Registry, out: &mut Vec<ResolvedEvent>) -> Reconcile {
        debug!("Rescanning {}", self.target.display());
        out.push(ResolvedEvent::new(self.target.clone(), RawEventKind::Overflow));

        let vanished: Vec<PathBuf> = self
            .dirs
            .keys()
            .filter(|dir| !is_directory(dir))
            .cloned()
            .collect();
        for dir in vanished {
            self.drop_subtree(registry, &dir);
        }

        self.sync_chain(registry, out, Populate::Silent, true, true)
    }
}

fn populate_for(kind: RawEventKind) -> Populate {
    if kind == RawEventKind::Create {
        Populate::Report
    } else {
        Populate::Silent
    }
}

fn resolved(path: PathBuf, event: &RawEvent, is_dir: Option<bool>) -> ResolvedEvent {
    ResolvedEvent::new(path, event.kind)
        .with_cookie(event.cookie)
        .with_dir_hint(is_dir)
}

/// Directory, following symlinks (ancestors may be links)
fn is_directory(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Directory, not following symlinks (subtrees never descend through links)
fn is_real_directory(path: &Path) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
