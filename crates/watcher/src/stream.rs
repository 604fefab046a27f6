//! Async adapter over [`FilePathWatcher`]
//!
//! For callers on a tokio runtime: changes arrive as a
//! [`Stream`](futures::Stream) instead of through a callback. A terminal
//! error is yielded as one `Err` item, after which the stream ends.

use crate::change::ChangeInfo;
use crate::error::WatchError;
use crate::watcher::{Callback, FilePathWatcher, WatchOptions};
use futures::Stream;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub struct ChangeStream {
    watcher: FilePathWatcher,
    changes: mpsc::UnboundedReceiver<Result<ChangeInfo, WatchError>>,
}

impl ChangeStream {
    /// Watch `path` on the process-wide service
    pub fn watch(path: impl AsRef<Path>, options: &WatchOptions) -> Result<Self, WatchError> {
        Self::with_watcher(FilePathWatcher::new(), path, options)
    }

    /// Watch `path` with an idle `watcher` (e.g. one built with a dedicated service)
    pub fn with_watcher(
        mut watcher: FilePathWatcher,
        path: impl AsRef<Path>,
        options: &WatchOptions,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        watcher.install(path.as_ref(), options, move |_| {
            let forward: Callback = Box::new(move |delivery: Result<&ChangeInfo, &WatchError>| {
                let item = delivery.map(Clone::clone).map_err(Clone::clone);
                // Receiver gone means the stream was dropped mid-delivery
                let _ = tx.send(item);
            });
            forward
        })?;

        Ok(Self {
            watcher,
            changes: rx,
        })
    }

    /// Next change; `None` once the watch has ended
    pub async fn next_change(&mut self) -> Option<Result<ChangeInfo, WatchError>> {
        self.changes.recv().await
    }

    pub fn target(&self) -> Option<&Path> {
        self.watcher.target()
    }

    /// See [`FilePathWatcher::wait_until_ready`]
    pub fn wait_until_ready(&self) -> Result<(), WatchError> {
        self.watcher.wait_until_ready()
    }

    /// Stop watching; changes already queued can still be read
    pub fn stop(&mut self) {
        self.watcher.stop();
    }
}

impl Stream for ChangeStream {
    type Item = Result<ChangeInfo, WatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().changes.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::backend::{NativeWatchBackend, RawEventKind};
    use crate::change::ChangeType;
    use crate::config::WatcherConfig;
    use crate::service::WatchService;
    use futures::StreamExt;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stream_yields_changes_then_error() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();

        let mut control = None;
        let service = WatchService::with_backend(WatcherConfig::default(), |sink| {
            let (backend, ctl) = FakeBackend::new(sink);
            control = Some(ctl);
            Ok(Box::new(backend) as Box<dyn NativeWatchBackend>)
        })
        .unwrap();
        let control = control.unwrap();

        let options = WatchOptions {
            report_modified_path: true,
            ..WatchOptions::recursive()
        };
        let mut stream = ChangeStream::with_watcher(FilePathWatcher::with_service(service), &root, &options).unwrap();
        stream.wait_until_ready().unwrap();

        control.emit(control.event(&root, RawEventKind::Write, "f"));
        let change = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(change.change_type, ChangeType::Modified);
        assert_eq!(change.path(), root.join("f"));

        // Registering a new directory past the limit is fatal
        control.set_limit(Some(control.live_count()));
        std::fs::create_dir(root.join("sub")).unwrap();
        control.emit(control.event(&root, RawEventKind::Create, "sub"));

        let mut saw_error = false;
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(5), stream.next_change()).await {
            if let Err(err) = item {
                assert!(matches!(err, WatchError::ResourceExhausted { .. }));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
