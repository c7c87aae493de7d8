//! tsm-cli - Command-line interface for tsm
//!
//! Runs one command against a server and prints the result.

mod commands;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use tsm_client::{Client, ConnectionConfig};
use tsm_protocol::message::InstanceKeyParams;

#[derive(Parser)]
#[command(name = "tsm-cli")]
#[command(about = "Command-line interface for the tsm state machine service")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, env = "TSM_SERVER", default_value = "127.0.0.1:7450")]
    server: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies one instance.
#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Machine name
    #[arg(short, long)]
    machine: String,

    /// Kind of external entity the instance tracks (e.g. "document")
    #[arg(short = 'n', long)]
    external_name: String,

    /// Identifier of the external entity
    #[arg(short = 'i', long)]
    external_id: String,
}

impl KeyArgs {
    pub fn key(&self) -> InstanceKeyParams {
        InstanceKeyParams::new(&self.external_name, &self.external_id, &self.machine)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Get server info
    Info,

    /// Register a machine definition
    PutMachine {
        /// Definition JSON (or @file.json / @file.yaml to read from file)
        definition: String,
    },

    /// Get a machine definition
    GetMachine {
        /// Machine name
        #[arg(short, long)]
        machine: String,
    },

    /// List all machines
    ListMachines,

    /// List every transition a machine defines
    ListTransitions {
        /// Machine name
        #[arg(short, long)]
        machine: String,
    },

    /// Create an instance in its machine's initial state
    Initiate {
        #[command(flatten)]
        key: KeyArgs,

        /// Who initiated the instance
        #[arg(short, long)]
        by: String,
    },

    /// Get an instance
    Get {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Delete an instance (its history is kept)
    Delete {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// List transitions legal from an instance's current state
    Possible {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Apply a named transition to an instance
    Transition {
        #[command(flatten)]
        key: KeyArgs,

        /// Transition name
        #[arg(short, long)]
        transition: String,

        /// Who made the transition
        #[arg(short, long)]
        by: String,

        /// Free-form comment (at most 200 characters)
        #[arg(short, long, default_value = "")]
        comment: String,
    },

    /// Show the audit history of an instance
    History {
        #[command(flatten)]
        key: KeyArgs,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    tracing::debug!("Connecting to {}", cli.server);
    let config = ConnectionConfig::new(cli.server).with_client_name("tsm-cli");
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match commands::execute(&client, cli.command).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            let _ = client.close().await;
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
