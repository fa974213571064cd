use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Kestrel - a HotStuff BFT consensus node
#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Kestrel validator node and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a validator node
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Write configuration files for a local validator set
    Init {
        /// Output path; with more than one validator, files are suffixed -0, -1, ...
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,

        /// Number of validators to generate
        #[arg(long, default_value_t = 1)]
        validators: u16,

        /// Listen port of the first validator; the others follow
        #[arg(long, default_value_t = 8080)]
        base_port: u16,

        /// Drive rounds by hand through the debug endpoints
        #[arg(long, default_value_t = false)]
        manual: bool,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show chain and consensus status of a node
    Status {
        /// Node HTTP endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Queue a transaction for block production
    Tx {
        /// Node HTTP endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,

        /// Transaction payload as UTF-8 text
        #[arg(long, conflicts_with = "hex")]
        text: Option<String>,

        /// Transaction payload as hex bytes
        #[arg(long)]
        hex: Option<String>,
    },

    /// Ask a node to broadcast NewRound for its next view
    NextView {
        /// Node HTTP endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Expire a node's current round
    Timeout {
        /// Node HTTP endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },
}
