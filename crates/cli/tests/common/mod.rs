//! Helpers for running the `pathwatch` binary

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Receiver};
use std::thread;

/// Finished command output
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub fn pathwatch() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_pathwatch"));
    command.env_remove("RUST_LOG");
    command
}

/// Run to completion with the given arguments
pub fn run(args: &[&str]) -> Result<CommandResult> {
    let output = pathwatch()
        .args(args)
        .output()
        .context("Failed to execute pathwatch")?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// A long-running `pathwatch` whose stdout lines arrive on a channel
pub struct Running {
    child: Child,
    pub lines: Receiver<String>,
}

impl Running {
    pub fn spawn(args: &[&str]) -> Result<Self> {
        let mut child = pathwatch()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn pathwatch")?;

        let stdout = child.stdout.take().context("No stdout")?;
        let (tx, rx) = channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self { child, lines: rx })
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
