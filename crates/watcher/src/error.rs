//! Error types for the watcher
//!
//! Recoverable backend conditions (`NotFound`) are absorbed by the watch tree
//! and never reach callers. Everything in [`WatchError`] is either rejected
//! synchronously by the `watch*` calls or delivered once as a terminal error.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`NativeWatchBackend`](crate::backend::NativeWatchBackend)
#[derive(Debug, Error)]
pub enum BackendError {
    /// The directory does not exist (or is not a directory)
    #[error("directory not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The native watch limit was reached
    #[error("native watch limit reached while registering {}", .0.display())]
    ResourceExhausted(PathBuf),

    /// Any other I/O failure while registering
    #[error("failed to register {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Error raised by the notify crate that has no better mapping
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

impl BackendError {
    /// Map a notify error for `path` onto the backend taxonomy
    pub fn from_notify(path: PathBuf, err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::MaxFilesWatch => BackendError::ResourceExhausted(path),
            notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
                BackendError::NotFound(path)
            }
            notify::ErrorKind::Io(source) => Self::from_io(path, source),
            kind => BackendError::Notify(notify::Error {
                kind,
                paths: err.paths,
            }),
        }
    }

    /// Map an I/O error for `path` onto the backend taxonomy
    pub fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => BackendError::NotFound(path),
            _ if is_not_a_directory(&source) => BackendError::NotFound(path),
            _ if is_watch_limit(&source) => BackendError::ResourceExhausted(path),
            _ => BackendError::Io { path, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

fn is_not_a_directory(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(20)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// ENOSPC from inotify_add_watch and EMFILE from inotify_init both mean the
/// kernel's per-user budget is spent.
fn is_watch_limit(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(28) | Some(24))
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Errors surfaced to users of [`FilePathWatcher`](crate::FilePathWatcher)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// Invalid request, rejected before any work starts
    #[error("invalid watch configuration: {0}")]
    BadConfiguration(String),

    /// Recursive watching requested on a backend that can't provide it
    #[error("recursive watching is not supported by the {backend} backend")]
    Unsupported { backend: &'static str },

    /// The native watch limit was reached; the watch is dead
    #[error("native watch limit reached while watching {}", path.display())]
    ResourceExhausted { path: PathBuf },

    /// `watch*` was called twice on the same watcher
    #[error("watcher is already watching {}", .0.display())]
    AlreadyWatching(PathBuf),

    /// The backend could not be started
    #[error("failed to start the {backend} backend: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// The watch service thread is gone
    #[error("watch service is no longer running")]
    ServiceUnavailable,
}

impl WatchError {
    /// Whether this error ends the watch (as opposed to a rejected request)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WatchError::ResourceExhausted { .. } | WatchError::ServiceUnavailable
        )
    }
}

/// Errors loading or validating a [`WatcherConfig`](crate::WatcherConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_error_mapping() {
        let path = PathBuf::from("/tmp/x");

        let err = BackendError::from_notify(path.clone(), notify::Error::new(notify::ErrorKind::MaxFilesWatch));
        assert!(matches!(err, BackendError::ResourceExhausted(_)));

        let err = BackendError::from_notify(path.clone(), notify::Error::path_not_found());
        assert!(err.is_not_found());

        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = BackendError::from_notify(path.clone(), notify::Error::io(io));
        assert!(err.is_not_found());

        let err = BackendError::from_notify(path, notify::Error::generic("boom"));
        assert!(matches!(err, BackendError::Notify(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_enospc_is_exhaustion() {
        let err = BackendError::from_io(PathBuf::from("/d"), io::Error::from_raw_os_error(28));
        assert!(matches!(err, BackendError::ResourceExhausted(_)));
    }

    #[test]
    fn test_terminal_errors() {
        assert!(WatchError::ResourceExhausted { path: PathBuf::from("/a") }.is_terminal());
        assert!(!WatchError::BadConfiguration("x".into()).is_terminal());
        assert!(!WatchError::Unsupported { backend: "fake" }.is_terminal());
    }
}
