//! Watch a path and print changes until Ctrl-C

use crate::util::{change_label, describe, format_timestamp, load_config, path_type_label};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use pathwatch::{
    BackendKind, ChangeInfo, ChangeStream, FilePathWatcher, WatchOptions, WatchService, WatchType,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub struct WatchArgs {
    pub path: PathBuf,
    pub recursive: bool,
    pub report_root: bool,
    pub excludes: Vec<String>,
    pub exclude_file: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// One line of `--json` output
#[derive(Serialize)]
struct ChangeLine<'a> {
    timestamp: String,
    /// Path the user asked to see (the watched root with `--report-root`)
    path: &'a Path,
    #[serde(flatten)]
    change: &'a ChangeInfo,
}

pub async fn run(args: WatchArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    let service = WatchService::start(config).context("Failed to start watch service")?;
    tracing::debug!("Using {} backend", service.backend_name());

    let options = WatchOptions {
        watch_type: if args.recursive {
            WatchType::Recursive
        } else {
            WatchType::NonRecursive
        },
        report_modified_path: !args.report_root,
        excludes: args.excludes,
        exclude_file: args.exclude_file,
    };

    let mut stream = ChangeStream::with_watcher(FilePathWatcher::with_service(service), &args.path, &options)
        .with_context(|| format!("Failed to watch {}", args.path.display()))?;
    tokio::task::block_in_place(|| stream.wait_until_ready())
        .with_context(|| format!("Failed to watch {}", args.path.display()))?;

    let root = stream
        .target()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| args.path.clone());

    if !args.json {
        eprintln!(
            "{} {}{}",
            "Watching".dimmed(),
            root.display().cyan(),
            if args.recursive { " (recursive)".dimmed().to_string() } else { String::new() }
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("Interrupted");
                break;
            }
            next = stream.next_change() => match next {
                Some(Ok(change)) => {
                    let shown = if args.report_root { root.as_path() } else { change.path() };
                    print_change(&change, shown, args.json)?;
                }
                Some(Err(e)) => {
                    return Err(e).with_context(|| format!("Watch on {} ended", root.display()));
                }
                None => break,
            },
        }
    }

    stream.stop();
    Ok(())
}

fn print_change(change: &ChangeInfo, shown: &Path, json: bool) -> Result<()> {
    let now = chrono::Local::now();

    if json {
        let line = ChangeLine {
            timestamp: now.to_rfc3339(),
            path: shown,
            change,
        };
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!(
            "{} {} {} {}",
            format_timestamp(&now).dimmed(),
            change_label(change.change_type),
            path_type_label(change.file_path_type).dimmed(),
            describe(change, shown)
        );
    }
    Ok(())
}
