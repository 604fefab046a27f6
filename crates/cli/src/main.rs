//! Pathwatch CLI - pathwatch command

use anyhow::Result;
use clap::{Parser, Subcommand};
use pathwatch::BackendKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;
mod util;

/// Pathwatch - Watch files and directories for changes
#[derive(Parser)]
#[command(name = "pathwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging on stderr (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a path and print every change until interrupted
    Watch {
        /// File or directory to watch (need not exist yet)
        path: PathBuf,
        /// Watch the whole subtree
        #[arg(short, long)]
        recursive: bool,
        /// Print the watched path instead of the path that changed
        #[arg(long)]
        report_root: bool,
        /// Gitignore-style pattern to exclude (repeatable)
        #[arg(short = 'x', long = "exclude")]
        excludes: Vec<String>,
        /// File of gitignore-style patterns to exclude
        #[arg(long)]
        exclude_file: Option<PathBuf>,
        /// Backend to use (native or poll), overriding the config file
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Watch service config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Show backend capabilities and native watch usage
    Info {
        /// Watch service config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    match cli.command {
        Commands::Watch {
            path,
            recursive,
            report_root,
            excludes,
            exclude_file,
            backend,
            config,
            json,
        } => {
            let args = cmd::watch::WatchArgs {
                path,
                recursive,
                report_root,
                excludes,
                exclude_file,
                backend,
                config,
                json,
            };
            cmd::watch::run(args).await
        }
        Commands::Info { config, json } => cmd::info::run(config.as_deref(), json).await,
    }
}

/// Logs go to stderr so stdout stays clean for change output
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "pathwatch=debug,pathwatch_cli=debug",
        _ => "pathwatch=trace,pathwatch_cli=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
