//! # sync-cli
//!
//! CLI tool for exercising scoutsync.
//!
//! ## Commands
//!
//! - `room`: Generate, check, or resume a room code
//! - `config`: Print the effective configuration
//! - `status`: Show the saved rejoin state
//! - `resolve`: Classify a batch of records against local records
//! - `demo`: Run a host and clients in-process and sync sample records
//!
//! ## Example
//!
//! ```bash
//! # New room code
//! sync-cli room
//!
//! # Back to the room of the last session
//! sync-cli room --resume
//!
//! # What would importing a scout's export do to my records?
//! sync-cli resolve --local mine.json --incoming theirs.json
//!
//! # Watch a host pull from three clients
//! sync-cli --verbose demo --clients 3
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use commands::{demo, resolve, room, settings, status};

/// CLI tool for exercising scoutsync.
#[derive(Parser, Debug)]
#[command(name = "sync-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the rejoin state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a room code, or check one
    Room {
        /// Code to validate instead of generating
        #[arg(long)]
        check: Option<String>,

        /// Reuse the room of the last session if one is saved
        #[arg(long, conflicts_with = "check")]
        resume: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Show the saved rejoin state
    Status,

    /// Classify incoming records against local records
    Resolve {
        /// JSON array of local records
        #[arg(long)]
        local: PathBuf,

        /// JSON array of incoming records
        #[arg(long)]
        incoming: PathBuf,
    },

    /// Sync sample records between an in-process host and clients
    Demo {
        /// Number of clients
        #[arg(long, default_value = "2")]
        clients: usize,

        /// Records each client holds
        #[arg(long, default_value = "4")]
        records: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let node_config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Room { check, resume } => match check {
            Some(code) => {
                room::check(&code)?;
            }
            None if resume => {
                let path = rejoin_path(&node_config, cli.data_dir)?;
                room::resume(&path).await?;
            }
            None => room::generate(),
        },
        Commands::Config => {
            settings::run(&node_config)?;
        }
        Commands::Status => {
            let path = rejoin_path(&node_config, cli.data_dir)?;
            status::run(&path).await?;
        }
        Commands::Resolve { local, incoming } => {
            resolve::run(&node_config, &local, &incoming).await?;
        }
        Commands::Demo { clients, records } => {
            demo::run(&node_config, clients, records).await?;
        }
    }

    Ok(())
}

fn rejoin_path(node_config: &sync_client::NodeConfig, data_dir: Option<PathBuf>) -> Result<PathBuf> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => config::default_data_dir()?,
    };
    Ok(config::rejoin_path(node_config, &data_dir))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
