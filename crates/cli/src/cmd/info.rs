//! Show backend capabilities and native watch usage

use crate::util::{format_limit, load_config};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use pathwatch::{limits, WatchService};
use std::path::Path;

pub async fn run(config: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let batch_window_ms = config.batch_window_ms;
    let service = WatchService::start(config).context("Failed to start watch service")?;
    let capabilities = service.capabilities();

    if json {
        let info = serde_json::json!({
            "backend": service.backend_name(),
            "recursive": capabilities.recursive,
            "correlates_moves": capabilities.correlates_moves,
            "batch_window_ms": batch_window_ms,
            "live_watches": limits::live_watches(),
            "max_watches": limits::max_watches(),
            "system_max_watches": limits::system_max_watches(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", "Watch Service".bold());
    println!("  Backend:          {}", service.backend_name().cyan());
    println!("  Recursive:        {}", yes_no(capabilities.recursive));
    println!("  Move cookies:     {}", yes_no(capabilities.correlates_moves));
    println!("  Batch window:     {}ms", batch_window_ms);
    println!();
    println!("{}", "Native Watches".bold());
    println!("  In use:           {}", limits::live_watches());
    println!("  Process cap:      {}", format_limit(limits::max_watches()));
    println!("  System limit:     {}", format_limit(limits::system_max_watches()));

    Ok(())
}

fn yes_no(value: bool) -> String {
    if value {
        "yes".green().to_string()
    } else {
        "no".yellow().to_string()
    }
}
