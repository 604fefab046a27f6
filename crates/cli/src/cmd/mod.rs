//! CLI subcommands

pub mod info;
pub mod watch;
