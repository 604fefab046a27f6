//! Change notifications delivered to watcher callbacks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Deleted,
    Modified,
    Moved,
    /// Something changed but the backend can't say what (e.g. queue overflow)
    Unknown,
}

/// Kind of filesystem object a change refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePathType {
    File,
    Directory,
    Unknown,
}

/// One observed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub change_type: ChangeType,
    pub file_path_type: FilePathType,
    /// The path that actually changed (the destination for moves)
    pub modified_path: PathBuf,
    /// Source path, present only for [`ChangeType::Moved`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_from_path: Option<PathBuf>,
}

impl ChangeInfo {
    pub fn new(change_type: ChangeType, file_path_type: FilePathType, path: impl Into<PathBuf>) -> Self {
        Self {
            change_type,
            file_path_type,
            modified_path: path.into(),
            moved_from_path: None,
        }
    }

    pub fn moved(file_path_type: FilePathType, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            change_type: ChangeType::Moved,
            file_path_type,
            modified_path: to.into(),
            moved_from_path: Some(from.into()),
        }
    }

    /// Generic "rescan needed" change on `root`
    pub fn unknown(root: impl Into<PathBuf>) -> Self {
        Self::new(ChangeType::Unknown, FilePathType::Unknown, root)
    }

    pub fn path(&self) -> &Path {
        &self.modified_path
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Created => "created",
            ChangeType::Deleted => "deleted",
            ChangeType::Modified => "modified",
            ChangeType::Moved => "moved",
            ChangeType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FilePathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilePathType::File => "file",
            FilePathType::Directory => "dir",
            FilePathType::Unknown => "?",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ChangeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.moved_from_path {
            Some(from) => write!(
                f,
                "{} [{}] {} -> {}",
                self.change_type,
                self.file_path_type,
                from.display(),
                self.modified_path.display()
            ),
            None => write!(
                f,
                "{} [{}] {}",
                self.change_type,
                self.file_path_type,
                self.modified_path.display()
            ),
        }
    }
}
