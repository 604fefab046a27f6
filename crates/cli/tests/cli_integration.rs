//! End-to-end runs of the `pathwatch` binary

mod common;

use common::{run, Running};
use std::fs;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[test]
fn test_info_json() {
    let result = run(&["info", "--json"]).unwrap();
    assert!(result.success(), "stderr: {}", result.stderr);

    let info: serde_json::Value = serde_json::from_str(&result.stdout).unwrap();
    assert_eq!(info["backend"], "native");
    assert!(info["max_watches"].as_u64().unwrap() > 0);
}

#[test]
fn test_info_with_poll_config() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("pathwatch.toml");
    fs::write(&config, "backend = \"poll\"\npoll_interval_ms = 100\n").unwrap();

    let result = run(&["info", "--json", "--config", config.to_str().unwrap()]).unwrap();
    assert!(result.success(), "stderr: {}", result.stderr);

    let info: serde_json::Value = serde_json::from_str(&result.stdout).unwrap();
    assert_eq!(info["backend"], "poll");
}

#[test]
fn test_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.toml");

    let result = run(&["info", "--config", missing.to_str().unwrap()]).unwrap();
    assert!(!result.success());
    assert!(result.stderr.contains("Failed to load config"), "stderr: {}", result.stderr);
}

#[test]
fn test_unknown_backend_rejected() {
    let dir = TempDir::new().unwrap();
    let result = run(&["watch", dir.path().to_str().unwrap(), "--backend", "kqueue"]).unwrap();
    assert!(!result.success());
    assert!(result.stderr.contains("kqueue"), "stderr: {}", result.stderr);
}

#[test]
fn test_watch_prints_json_lines() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let file = root.join("hello.txt");

    let running = Running::spawn(&["watch", root.to_str().unwrap(), "--json"]).unwrap();

    // Startup time is unknown, so keep touching the file until a line shows up
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut found = None;
    let mut i = 0;
    while found.is_none() && Instant::now() < deadline {
        fs::write(&file, format!("{}", i)).unwrap();
        i += 1;
        while let Ok(line) = running.lines.recv_timeout(Duration::from_millis(200)) {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            if value["path"] == file.to_str().unwrap() {
                found = Some(value);
                break;
            }
        }
    }

    let value = found.expect("no change line for hello.txt");
    let change_type = value["change_type"].as_str().unwrap();
    assert!(change_type == "created" || change_type == "modified", "{}", value);
    assert_eq!(value["file_path_type"], "file");
    assert!(value["timestamp"].is_string());
}
