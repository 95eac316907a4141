//! Chat overlay node
//!
//! Runs a peer of the chat server overlay and inspects its configuration and
//! peer directory.

use chat_overlay::cli::{self, StartOptions};
use chat_overlay::config::DEFAULT_DATA_DIR;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "overlay")]
#[command(version)]
#[command(about = "Peer-to-peer overlay for chat servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until Ctrl+C
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,

        /// Bootstrap peers (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Directory for the peer registry and attachments
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Validate a configuration file and print the effective values
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List the durable peer directory
    Peers {
        #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            port,
            name,
            peers,
            data_dir,
        } => {
            let options = StartOptions {
                config,
                port,
                name,
                peers,
                data_dir,
            };
            let config = cli::resolve_config(&options)?;
            cli::cmd_start(config)?;
        }

        Commands::CheckConfig { config } => {
            cli::cmd_check_config(&config)?;
        }

        Commands::Peers { data_dir } => {
            cli::cmd_peers(&data_dir)?;
        }
    }

    Ok(())
}
