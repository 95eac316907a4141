//! Command-line interface

pub mod commands;

pub use commands::{cmd_check_config, cmd_peers, cmd_start, resolve_config, CliResult, StartOptions};
