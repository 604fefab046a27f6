//! Turns resolved raw events into [`ChangeInfo`] values
//!
//! Works on one batch at a time. Move halves are paired by cookie (or, for
//! backends without cookies, by strict adjacency) and nothing is carried over
//! between batches: a half whose partner arrives in a later batch is reported
//! as a plain deletion or creation.

use crate::backend::RawEventKind;
use crate::change::{ChangeInfo, ChangeType, FilePathType};
use crate::tree::ResolvedEvent;
use ahash::AHashMap;
use std::fs;
use std::path::{Path, PathBuf};

enum Slot {
    Ready(ChangeInfo),
    /// Move source waiting for its destination
    MoveFrom { from: PathBuf, is_dir: Option<bool> },
}

/// Classify one batch of events for one watch, in order
pub(crate) fn classify(events: &[ResolvedEvent]) -> Vec<ChangeInfo> {
    let mut slots: Vec<Slot> = Vec::with_capacity(events.len());
    let mut by_cookie: AHashMap<usize, usize> = AHashMap::new();
    // Slot of a cookie-less MoveFrom that was the previous event
    let mut adjacent_from: Option<usize> = None;

    for event in events {
        let previous_from = adjacent_from.take();

        let change_type = match event.kind {
            RawEventKind::Create => ChangeType::Created,
            RawEventKind::Write | RawEventKind::CloseWrite | RawEventKind::Attrib => {
                ChangeType::Modified
            }
            RawEventKind::Delete | RawEventKind::DeleteSelf | RawEventKind::MoveSelf => {
                ChangeType::Deleted
            }
            RawEventKind::Overflow => {
                slots.push(Slot::Ready(ChangeInfo::unknown(event.path.clone())));
                continue;
            }
            RawEventKind::MoveFrom => {
                let index = slots.len();
                slots.push(Slot::MoveFrom {
                    from: event.path.clone(),
                    is_dir: event.is_dir,
                });
                match event.cookie {
                    Some(cookie) => {
                        by_cookie.insert(cookie, index);
                    }
                    None => adjacent_from = Some(index),
                }
                continue;
            }
            RawEventKind::MoveTo => {
                let source = match event.cookie {
                    Some(cookie) => by_cookie.remove(&cookie),
                    None => previous_from,
                };

                if let Some(index) = source {
                    if let Slot::MoveFrom { from, is_dir } = &slots[index] {
                        let path_type = path_type(&event.path, event.is_dir.or(*is_dir));
                        let moved = ChangeInfo::moved(path_type, from.clone(), event.path.clone());
                        slots[index] = Slot::Ready(moved);
                        continue;
                    }
                }
                // Moved in from outside the watched scope
                ChangeType::Created
            }
        };

        slots.push(Slot::Ready(ChangeInfo::new(
            change_type,
            path_type(&event.path, event.is_dir),
            event.path.clone(),
        )));
    }

    let mut changes: Vec<ChangeInfo> = slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Ready(change) => change,
            // Moved out of the watched scope
            Slot::MoveFrom { from, is_dir } => {
                let path_type = hint_type(is_dir);
                ChangeInfo::new(ChangeType::Deleted, path_type, from)
            }
        })
        .collect();

    settle_moved_types(&mut changes);

    changes.dedup_by(|next, prev| {
        next.change_type == prev.change_type
            && next.modified_path == prev.modified_path
            && next.moved_from_path == prev.moved_from_path
    });
    changes
}

/// Give a type to changes whose path vanished because a parent directory
/// was renamed later in the same batch: look where that rename put it.
fn settle_moved_types(changes: &mut [ChangeInfo]) {
    let renames: Vec<(usize, PathBuf, PathBuf)> = changes
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let from = c.moved_from_path.clone()?;
            Some((i, from, c.modified_path.clone()))
        })
        .collect();
    if renames.is_empty() {
        return;
    }

    for (i, change) in changes.iter_mut().enumerate() {
        if change.file_path_type != FilePathType::Unknown || change.change_type == ChangeType::Deleted {
            continue;
        }

        let mut current = change.modified_path.clone();
        for (_, from, to) in renames.iter().filter(|(at, _, _)| *at > i) {
            if let Ok(rest) = current.strip_prefix(from) {
                if !rest.as_os_str().is_empty() {
                    current = to.join(rest);
                }
            }
        }
        if current != change.modified_path {
            change.file_path_type = path_type(&current, None);
        }
    }
}

/// What is at `path` now, or failing that what the backend said it was
fn path_type(path: &Path, hint: Option<bool>) -> FilePathType {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => FilePathType::Directory,
        Ok(_) => FilePathType::File,
        Err(_) => hint_type(hint),
    }
}

fn hint_type(hint: Option<bool>) -> FilePathType {
    match hint {
        Some(true) => FilePathType::Directory,
        Some(false) => FilePathType::File,
        None => FilePathType::Unknown,
    }
}
