use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod node;
mod rpc;
mod transport;

use cli::{Cli, Commands};
use config::{generate_testnet_configs, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_node(&config).await?;
        }
        Commands::Init {
            output,
            validators,
            base_port,
            manual,
        } => {
            init_config(&output, validators, base_port, manual)?;
        }
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
        Commands::Status { endpoint } => {
            show_status(&endpoint).await?;
        }
        Commands::Tx {
            endpoint,
            text,
            hex,
        } => {
            let data = match (text, hex) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(encoded)) => ::hex::decode(encoded)?,
                (None, None) => bail!("pass the transaction with --text or --hex"),
            };
            submit_transaction(&endpoint, &data).await?;
        }
        Commands::NextView { endpoint } => {
            post_control(&endpoint, "/debug/next_view").await?;
        }
        Commands::Timeout { endpoint } => {
            post_control(&endpoint, "/debug/timeout").await?;
        }
    }

    Ok(())
}

/// Run a validator node
async fn run_node(config_path: &Path) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);
    if !config_path.exists() {
        bail!(
            "Configuration file not found: {}. Run 'kestrel init' to create one.",
            config_path.display()
        );
    }
    let config = NodeConfig::load(config_path)?;

    let node = Node::new(config)?;
    node.run().await
}

/// Write one config per validator
fn init_config(output: &Path, validators: u16, base_port: u16, manual: bool) -> Result<()> {
    if validators == 0 {
        bail!("at least one validator is required");
    }
    let configs = generate_testnet_configs(validators, base_port, manual);

    for (i, config) in configs.iter().enumerate() {
        let path = if configs.len() == 1 {
            output.to_path_buf()
        } else {
            indexed_path(output, i)
        };
        config.save(&path)?;
        println!("Configuration file created: {}", path.display());
        println!("  listen: {}  data: {}", config.listen_addr, config.data_dir.display());
    }

    println!("\nTo start a node, run:");
    println!("  kestrel run --config <file>");
    Ok(())
}

/// `config.json` -> `config-2.json`
fn indexed_path(output: &Path, index: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    output.with_file_name(name)
}

/// Generate a new keypair
fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = kestrel_core::KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Address:     {}", keypair.address());
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}

/// Show node status
async fn show_status(endpoint: &str) -> Result<()> {
    let url = format!("{}/status", endpoint.trim_end_matches('/'));
    let response = reqwest::get(&url).await?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        bail!("status request failed ({}): {}", status, body);
    }
    println!("Node Status:");
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Submit a transaction
async fn submit_transaction(endpoint: &str, data: &[u8]) -> Result<()> {
    let url = format!("{}/tx", endpoint.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&rpc::TxSubmitRequest {
            data: ::hex::encode(data),
        })
        .send()
        .await?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        bail!("transaction rejected ({}): {}", status, body);
    }
    println!("Transaction submitted:");
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn post_control(endpoint: &str, path: &str) -> Result<()> {
    let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        bail!("{} failed: {}", path, response.status());
    }
    println!("{} accepted", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_path() {
        assert_eq!(
            indexed_path(Path::new("net/config.json"), 2),
            PathBuf::from("net/config-2.json")
        );
        assert_eq!(indexed_path(Path::new("node"), 0), PathBuf::from("node-0"));
    }
}
