use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tessera - A permissioned consensus engine
#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera validator and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a validator
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Write a sample single-validator configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show node status
    Status {
        /// RPC endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Submit a command from a JSON file
    Submit {
        /// RPC endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,

        /// Command JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Sign a nonced command file in place
    Sign {
        /// Signer secret key hex
        #[arg(short, long)]
        key: String,

        /// Command JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Latest block number the signer observed, when the file has none
        #[arg(long)]
        block_number: Option<u64>,
    },
}
