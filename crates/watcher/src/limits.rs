//! Process-wide native watch budget
//!
//! Native watch descriptors are a kernel resource shared by the whole
//! process (per user, on Linux). Every registration made through a
//! [`Registry`](crate::registry::Registry) reserves one slot here, whatever
//! backend it goes to. The cap is the smaller of the test override and the
//! system limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

const NO_OVERRIDE: usize = usize::MAX;

static MAX_WATCHES_OVERRIDE: AtomicUsize = AtomicUsize::new(NO_OVERRIDE);
static LIVE_WATCHES: AtomicUsize = AtomicUsize::new(0);

/// Maximum number of concurrent native watches this process may hold
pub fn max_watches() -> usize {
    match MAX_WATCHES_OVERRIDE.load(Ordering::SeqCst) {
        NO_OVERRIDE => system_max_watches(),
        limit => limit.min(system_max_watches()),
    }
}

/// Number of native watches currently registered
pub fn live_watches() -> usize {
    LIVE_WATCHES.load(Ordering::SeqCst)
}

/// Install (or clear, with `None`) a cap on concurrent native watches.
///
/// Intended for tests that need to hit the exhaustion path deterministically.
/// Returns the previous override.
pub fn set_max_watches_override(limit: Option<usize>) -> Option<usize> {
    let previous = MAX_WATCHES_OVERRIDE.swap(limit.unwrap_or(NO_OVERRIDE), Ordering::SeqCst);
    (previous != NO_OVERRIDE).then_some(previous)
}

/// Limit read from the OS, cached on first use
pub fn system_max_watches() -> usize {
    static SYSTEM_LIMIT: OnceLock<usize> = OnceLock::new();
    *SYSTEM_LIMIT.get_or_init(read_system_limit)
}

#[cfg(target_os = "linux")]
fn read_system_limit() -> usize {
    const MAX_USER_WATCHES: &str = "/proc/sys/fs/inotify/max_user_watches";

    match std::fs::read_to_string(MAX_USER_WATCHES) {
        Ok(contents) => match contents.trim().parse::<usize>() {
            Ok(limit) if limit > 0 => limit,
            _ => {
                tracing::warn!("Unparseable {}: {:?}", MAX_USER_WATCHES, contents.trim());
                usize::MAX
            }
        },
        Err(e) => {
            tracing::debug!("Could not read {}: {}", MAX_USER_WATCHES, e);
            usize::MAX
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_system_limit() -> usize {
    usize::MAX
}

/// Reserve one slot; false when the budget is spent
pub(crate) fn try_reserve() -> bool {
    let max = max_watches();
    LIVE_WATCHES
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
            (live < max).then_some(live + 1)
        })
        .is_ok()
}

/// Give back a slot taken by [`try_reserve`]
pub(crate) fn release() {
    let _ = LIVE_WATCHES.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
        live.checked_sub(1)
    });
}

/// Installs a watch limit override for as long as it lives.
///
/// A limit of 0 refuses every new native watch.
///
/// ```no_run
/// use pathwatch::limits::ScopedWatchLimit;
///
/// let _limit = ScopedWatchLimit::new(8);
/// // watches beyond the eighth now fail with ResourceExhausted
/// ```
#[must_use = "the override is removed when the guard is dropped"]
pub struct ScopedWatchLimit {
    previous: Option<usize>,
}

impl ScopedWatchLimit {
    pub fn new(limit: usize) -> Self {
        Self {
            previous: set_max_watches_override(Some(limit)),
        }
    }
}

impl Drop for ScopedWatchLimit {
    fn drop(&mut self) {
        set_max_watches_override(self.previous);
    }
}
