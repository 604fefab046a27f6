//! The watcher sequence
//!
//! One thread per service owns the backend, the registry and every watch
//! tree. Nothing else touches native handles. Watchers talk to it through a
//! command channel; the backend feeds it raw events through a second one.
//!
//! Raw events are processed in batches: after the first event the thread
//! keeps collecting for `batch_window_ms` (or until `max_batch_events`), so
//! that the two halves of a move usually land in the same batch. Each event
//! is offered to every tree before the next one is looked at.
//!
//! Changes leave through one delivery queue per watcher. The sequence never
//! waits on a watcher, which is what makes stopping a watcher from inside its
//! own callback deadlock-free.

use crate::backend::{self, Capabilities, EventSink, NativeWatchBackend, RawEvent};
use crate::change::ChangeInfo;
use crate::classifier;
use crate::config::WatcherConfig;
use crate::error::{BackendError, WatchError};
use crate::registry::Registry;
use crate::tree::{ResolvedEvent, WatchRequest, WatchTree};
use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

pub(crate) type WatchId = u64;

/// What a watcher's delivery thread receives
#[derive(Debug)]
pub(crate) enum Delivery {
    Change(ChangeInfo),
    /// Terminal; nothing follows
    Failed(WatchError),
}

enum Command {
    Add {
        id: WatchId,
        request: WatchRequest,
        deliveries: Sender<Delivery>,
    },
    Remove {
        id: WatchId,
        done: Sender<()>,
    },
    /// Acknowledged once every earlier command has been handled
    Sync(Sender<()>),
    Shutdown,
}

/// Handle on a running watcher sequence
pub struct WatchService {
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    backend: &'static str,
    capabilities: Capabilities,
    next_id: AtomicU64,
}

static SHARED: Mutex<Option<Weak<WatchService>>> = parking_lot::const_mutex(None);

impl WatchService {
    /// The process-wide service, started with the default configuration if
    /// no watcher currently holds it
    pub fn shared() -> Result<Arc<WatchService>, WatchError> {
        let mut shared = SHARED.lock();
        if let Some(service) = shared.as_ref().and_then(Weak::upgrade) {
            return Ok(service);
        }

        let service = Self::start(WatcherConfig::default())?;
        *shared = Some(Arc::downgrade(&service));
        Ok(service)
    }

    /// The process-wide service, if some watcher is keeping it alive
    pub(crate) fn shared_if_running() -> Option<Arc<WatchService>> {
        SHARED.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Start a dedicated service
    pub fn start(config: WatcherConfig) -> Result<Arc<WatchService>, WatchError> {
        config
            .validate()
            .map_err(|e| WatchError::BadConfiguration(e.to_string()))?;

        let kind = config.backend;
        let factory_config = config.clone();
        Self::with_backend(config, move |sink| backend::from_config(&factory_config, sink)).map_err(
            |err| match err {
                WatchError::Backend { message, .. } => WatchError::Backend {
                    backend: kind.name(),
                    message,
                },
                other => other,
            },
        )
    }

    /// Start a service around a backend built by `factory`
    pub fn with_backend<F>(config: WatcherConfig, factory: F) -> Result<Arc<WatchService>, WatchError>
    where
        F: FnOnce(EventSink) -> Result<Box<dyn NativeWatchBackend>, BackendError>,
    {
        let (event_tx, event_rx) = unbounded();
        let backend = factory(event_tx).map_err(|e| WatchError::Backend {
            backend: "custom",
            message: e.to_string(),
        })?;

        let backend_name = backend.name();
        let capabilities = backend.capabilities();
        let (command_tx, command_rx) = unbounded();

        let sequence = Sequence {
            registry: Registry::new(backend),
            slots: BTreeMap::new(),
            config,
            events: event_rx,
            commands: command_rx,
        };

        let thread = thread::Builder::new()
            .name("pathwatch-sequence".to_string())
            .spawn(move || sequence.run())
            .map_err(|e| WatchError::Backend {
                backend: backend_name,
                message: format!("failed to spawn service thread: {}", e),
            })?;

        info!("Watch service started ({} backend)", backend_name);

        Ok(Arc::new(Self {
            commands: command_tx,
            thread: Mutex::new(Some(thread)),
            backend: backend_name,
            capabilities,
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn recursive_watch_available(&self) -> bool {
        self.capabilities.recursive
    }

    /// Block until every command sent so far has been handled, i.e. every
    /// watch added so far has its native watches in place
    pub fn sync(&self) -> Result<(), WatchError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Sync(tx))
            .map_err(|_| WatchError::ServiceUnavailable)?;
        rx.recv().map_err(|_| WatchError::ServiceUnavailable)
    }

    /// Queue a new watch; setup happens on the service thread
    pub(crate) fn add(&self, request: WatchRequest, deliveries: Sender<Delivery>) -> Result<WatchId, WatchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Add {
                id,
                request,
                deliveries,
            })
            .map_err(|_| WatchError::ServiceUnavailable)?;
        Ok(id)
    }

    /// Remove a watch and wait until its native watches are gone
    pub(crate) fn remove(&self, id: WatchId) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.commands.send(Command::Remove { id, done: done_tx }).is_err() {
            return;
        }
        // Err means the service thread is gone and took every watch with it
        let _ = done_rx.recv();
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Watch service thread panicked");
            }
        }
        debug!("Watch service stopped");
    }
}

/// One watch as seen by the service thread
struct Slot {
    tree: WatchTree,
    deliveries: Sender<Delivery>,
    resolved: Vec<ResolvedEvent>,
    failure: Option<WatchError>,
    /// Changes were dropped; an Unknown is owed
    overflowed: bool,
    /// A terminal error was delivered
    dead: bool,
}

impl Slot {
    fn deliver(&mut self, changes: Vec<ChangeInfo>, capacity: usize) {
        for change in changes {
            self.settle_overflow(capacity);
            if self.overflowed || self.deliveries.len() >= capacity {
                if !self.overflowed {
                    debug!(
                        "Delivery queue for {} full, dropping changes",
                        self.tree.target().display()
                    );
                }
                self.overflowed = true;
                continue;
            }
            self.send(Delivery::Change(change));
        }
        self.settle_overflow(capacity);
    }

    /// Queue the owed Unknown once there is room
    fn settle_overflow(&mut self, capacity: usize) {
        if self.overflowed && self.deliveries.len() < capacity {
            self.overflowed = false;
            let unknown = ChangeInfo::unknown(self.tree.target().to_path_buf());
            self.send(Delivery::Change(unknown));
        }
    }

    fn fail(&mut self, error: WatchError) {
        self.dead = true;
        self.send(Delivery::Failed(error));
    }

    fn send(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).is_err() {
            trace!("Watcher for {} is gone", self.tree.target().display());
        }
    }
}

struct Sequence {
    registry: Registry,
    slots: BTreeMap<WatchId, Slot>,
    config: WatcherConfig,
    events: Receiver<RawEvent>,
    commands: Receiver<Command>,
}

impl Sequence {
    fn run(mut self) {
        debug!("Watch sequence running ({} backend)", self.registry.backend_name());
        let commands = self.commands.clone();
        let mut events = self.events.clone();

        loop {
            let mut events_closed = false;

            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                recv(events) -> event => match event {
                    Ok(event) => {
                        let batch = self.collect_batch(event);
                        self.handle_batch(&batch);
                    }
                    Err(_) => events_closed = true,
                },
            }

            if events_closed {
                warn!("Backend event stream closed");
                events = never();
            }
        }

        for slot in self.slots.values_mut() {
            slot.tree.release_all(&mut self.registry);
        }
        debug!("Watch sequence exiting ({} watches)", self.slots.len());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add {
                id,
                request,
                deliveries,
            } => {
                debug!(
                    "Adding watch {} on {} (recursive={}, report_modified_path={})",
                    id,
                    request.target.display(),
                    request.recursive,
                    request.report_modified_path
                );
                let mut slot = Slot {
                    tree: WatchTree::new(&request),
                    deliveries,
                    resolved: Vec::new(),
                    failure: None,
                    overflowed: false,
                    dead: false,
                };
                if let Err(err) = slot.tree.initialize(&mut self.registry) {
                    slot.fail(err);
                }
                self.slots.insert(id, slot);
            }
            Command::Remove { id, done } => {
                if let Some(mut slot) = self.slots.remove(&id) {
                    slot.tree.release_all(&mut self.registry);
                    debug!(
                        "Removed watch on {} ({} native watches live)",
                        slot.tree.target().display(),
                        self.registry.live_count()
                    );
                }
                let _ = done.send(());
            }
            Command::Sync(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn collect_batch(&self, first: RawEvent) -> Vec<RawEvent> {
        let mut batch = vec![first];
        let deadline = Instant::now() + self.config.batch_window();

        while batch.len() < self.config.max_batch_events {
            match self.events.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => match self.events.recv_deadline(deadline) {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                },
            }
        }

        trace!("Collected batch of {} raw events", batch.len());
        batch
    }

    fn handle_batch(&mut self, batch: &[RawEvent]) {
        for event in batch {
            let mut claimed = false;

            for slot in self.slots.values_mut() {
                if slot.dead || slot.failure.is_some() {
                    continue;
                }
                match slot.tree.process(&mut self.registry, event, &mut slot.resolved) {
                    Ok(ours) => claimed |= ours,
                    Err(err) => {
                        claimed = true;
                        slot.failure = Some(err);
                    }
                }
            }

            if !claimed {
                if let Some(handle) = event.handle {
                    trace!(
                        "Dropping {:?} on stale handle {} ({:?})",
                        event.kind,
                        handle,
                        event.name.as_deref().map(Path::new)
                    );
                }
            }
        }

        let capacity = self.config.delivery_queue_capacity;
        for slot in self.slots.values_mut() {
            if !slot.resolved.is_empty() {
                let changes = classifier::classify(&slot.resolved);
                slot.resolved.clear();
                slot.deliver(changes, capacity);
            }
            if let Some(err) = slot.failure.take() {
                slot.fail(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeControl};
    use crate::backend::RawEventKind;
    use crate::change::ChangeType;
    use crate::filter::PathFilter;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn service_with(config: WatcherConfig) -> (Arc<WatchService>, FakeControl) {
        let mut control = None;
        let service = WatchService::with_backend(config, |sink| {
            let (backend, ctl) = FakeBackend::new(sink);
            control = Some(ctl);
            Ok(Box::new(backend) as Box<dyn NativeWatchBackend>)
        })
        .unwrap();
        (service, control.unwrap())
    }

    fn service() -> (Arc<WatchService>, FakeControl) {
        service_with(WatcherConfig::default())
    }

    fn request(target: &Path, recursive: bool) -> WatchRequest {
        WatchRequest {
            target: target.to_path_buf(),
            recursive,
            report_modified_path: true,
            filter: PathFilter::none(target),
        }
    }

    fn temp_root() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        (temp, root)
    }

    fn next_change(rx: &Receiver<Delivery>) -> ChangeInfo {
        match rx.recv_timeout(TIMEOUT).unwrap() {
            Delivery::Change(change) => change,
            Delivery::Failed(err) => panic!("unexpected failure: {}", err),
        }
    }

    #[test]
    fn test_events_reach_the_watch() {
        let (_temp, root) = temp_root();
        let (service, control) = service();

        let (tx, rx) = unbounded();
        service.add(request(&root, false), tx).unwrap();
        service.sync().unwrap();

        fs::write(root.join("a.txt"), b"x").unwrap();
        control.emit(control.event(&root, RawEventKind::Create, "a.txt"));

        let change = next_change(&rx);
        assert_eq!(change.change_type, ChangeType::Created);
        assert_eq!(change.path(), root.join("a.txt"));
    }

    #[test]
    fn test_watches_see_only_their_scope() {
        let (_temp, root) = temp_root();
        fs::create_dir(root.join("one")).unwrap();
        fs::create_dir(root.join("two")).unwrap();
        let (service, control) = service();

        let (tx_one, rx_one) = unbounded();
        let (tx_two, rx_two) = unbounded();
        service.add(request(&root.join("one"), false), tx_one).unwrap();
        service.add(request(&root.join("two"), false), tx_two).unwrap();
        service.sync().unwrap();

        control.emit(control.event(&root.join("two"), RawEventKind::Write, "f"));

        let change = next_change(&rx_two);
        assert_eq!(change.path(), root.join("two/f"));
        assert!(rx_one.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_initial_exhaustion_fails_once() {
        let (_temp, root) = temp_root();
        let (service, control) = service();
        control.set_limit(Some(1));

        let (tx, rx) = unbounded();
        service.add(request(&root, false), tx).unwrap();
        service.sync().unwrap();

        match rx.recv_timeout(TIMEOUT).unwrap() {
            Delivery::Failed(WatchError::ResourceExhausted { .. }) => {}
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(control.live_count(), 0);

        // Later backend noise produces nothing for the dead watch
        control.emit(RawEvent::overflow());
        service.sync().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_remove_releases_native_watches() {
        let (_temp, root) = temp_root();
        fs::create_dir_all(root.join("a/b")).unwrap();
        let (service, control) = service();

        let (tx, _rx) = unbounded();
        let id = service.add(request(&root, true), tx).unwrap();
        service.sync().unwrap();
        assert!(control.handle_for(&root.join("a/b")).is_some());

        service.remove(id);
        assert_eq!(control.live_count(), 0);
    }

    #[test]
    fn test_shared_directories_survive_partial_removal() {
        let (_temp, root) = temp_root();
        let (service, control) = service();

        let (tx_a, _rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        let a = service.add(request(&root, false), tx_a).unwrap();
        service.add(request(&root, false), tx_b).unwrap();
        service.sync().unwrap();

        service.remove(a);
        assert!(control.handle_for(&root).is_some());

        control.emit(control.event(&root, RawEventKind::Write, "x"));
        assert_eq!(next_change(&rx_b).path(), root.join("x"));
    }

    #[test]
    fn test_full_queue_collapses_into_unknown() {
        let (_temp, root) = temp_root();
        let config = WatcherConfig {
            delivery_queue_capacity: 2,
            ..Default::default()
        };
        let (service, control) = service_with(config);

        let (tx, rx) = unbounded();
        service.add(request(&root, false), tx).unwrap();
        service.sync().unwrap();

        for i in 0..5 {
            control.emit(control.event(&root, RawEventKind::Write, format!("f{}", i)));
        }
        service.sync().unwrap();
        // Give the batch time to be handled
        std::thread::sleep(Duration::from_millis(300));

        assert_eq!(next_change(&rx).path(), root.join("f0"));
        assert_eq!(next_change(&rx).path(), root.join("f1"));

        control.emit(control.event(&root, RawEventKind::Write, "later"));
        let unknown = next_change(&rx);
        assert_eq!(unknown, ChangeInfo::unknown(root.clone()));
        assert_eq!(next_change(&rx).path(), root.join("later"));
    }

    #[test]
    fn test_drop_shuts_down_and_releases() {
        let (_temp, root) = temp_root();
        let (service, control) = service();

        let (tx, rx) = unbounded();
        service.add(request(&root, false), tx).unwrap();
        service.sync().unwrap();
        assert!(control.live_count() > 0);

        drop(service);
        assert_eq!(control.live_count(), 0);
        // The delivery sender went with the service thread
        assert!(rx.recv_timeout(TIMEOUT).is_err());
    }
}
