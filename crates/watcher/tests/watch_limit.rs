//! Native watch budget exhaustion
//!
//! The budget is process-wide, so these tests take a lock and are the only
//! watchers in this test binary.

mod common;

use common::{non_recursive, recursive, Recorder, Workspace, QUIET};
use pathwatch::limits::{self, ScopedWatchLimit};
use pathwatch::ChangeType;
use parking_lot::Mutex;
use std::fs;

static BUDGET: Mutex<()> = parking_lot::const_mutex(());

#[test]
fn test_exhaustion_at_setup_is_one_terminal_error() {
    let _serial = BUDGET.lock();
    let ws = Workspace::new();
    let target = ws.path("file.txt");

    // The ancestor chain alone needs more than this
    let _limit = ScopedWatchLimit::new(limits::live_watches() + 1);
    let mut rec = Recorder::start(&target, &non_recursive());

    let error = rec.wait_for(|r| r.error).expect("no error callback");
    assert_eq!(error.path, target);

    // Nothing after the error, whatever happens on disk
    fs::write(&target, b"x").unwrap();
    let after = rec.drain(QUIET);
    assert!(after.is_empty(), "callbacks after error: {:?}", after);
    assert_eq!(rec.seen().iter().filter(|r| r.error).count(), 1);
}

#[test]
fn test_exhaustion_during_reconciliation() {
    let _serial = BUDGET.lock();
    let ws = Workspace::new();
    let mut rec = Recorder::start(&ws.root, &recursive());

    // Room for two more directories
    let _limit = ScopedWatchLimit::new(limits::live_watches() + 2);
    for i in 0..10 {
        fs::create_dir(ws.path(&format!("d{}", i))).unwrap();
    }

    let error = rec.wait_for(|r| r.error).expect("no error callback");
    assert_eq!(error.path, ws.root);

    fs::write(ws.path("after.txt"), b"x").unwrap();
    rec.drain(QUIET);

    let seen = rec.seen();
    let error_at = seen.iter().position(|r| r.error).unwrap();
    assert_eq!(error_at, seen.len() - 1, "callbacks after error: {:?}", &seen[error_at..]);
}

#[test]
fn test_watches_returned_on_drop() {
    let _serial = BUDGET.lock();
    let ws = Workspace::new();
    fs::create_dir_all(ws.path("a/b/c")).unwrap();
    let baseline = limits::live_watches();

    let mut rec = Recorder::start(&ws.root, &recursive());
    fs::write(ws.path("a/b/c/f"), b"x").unwrap();
    assert!(rec.wait_change(ChangeType::Created, &ws.path("a/b/c/f")));
    assert!(limits::live_watches() > baseline);

    drop(rec);
    assert_eq!(limits::live_watches(), baseline);
}

#[test]
fn test_budget_frees_up_after_failure() {
    let _serial = BUDGET.lock();
    let ws = Workspace::new();
    let target = ws.path("file.txt");

    {
        let _limit = ScopedWatchLimit::new(limits::live_watches() + 1);
        let mut rec = Recorder::start(&target, &non_recursive());
        assert!(rec.wait_for(|r| r.error).is_some());
    }

    // A new watcher once the cap is lifted works normally
    let mut rec = Recorder::start(&target, &non_recursive());
    fs::write(&target, b"x").unwrap();
    assert!(rec.wait_change(ChangeType::Created, &target));
    assert!(rec.seen().iter().all(|r| !r.error));
}

#[test]
fn test_zero_limit_refuses_every_watch() {
    let _serial = BUDGET.lock();
    let ws = Workspace::new();

    {
        let _limit = ScopedWatchLimit::new(0);
        assert_eq!(limits::max_watches(), 0);

        let mut rec = Recorder::start(&ws.root, &recursive());
        let error = rec.wait_for(|r| r.error).expect("no error callback");
        assert_eq!(error.path, ws.root);
    }

    assert!(limits::max_watches() > 0);
}
