use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use kestrel_consensus::{ConsensusConfig, PacemakerConfig};
use kestrel_core::{Address, GenesisConfig, KeyPair, PublicKey, SecretKey, Validator};
use kestrel_state::PoolConfig;
use serde::{Deserialize, Serialize};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Chain ID
    pub chain_id: u64,

    /// Node data directory
    pub data_dir: PathBuf,

    /// HTTP bind address for peer messages and the API
    pub listen_addr: SocketAddr,

    /// Validator secret key (hex)
    pub validator_key: Option<String>,

    /// Genesis validator set, including this node
    pub genesis: Vec<GenesisValidator>,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Public key (hex)
    pub public_key: String,
    #[serde(default = "default_voting_power")]
    pub voting_power: u64,
    /// Base URL peers use to reach this validator
    pub endpoint: String,
}

fn default_voting_power() -> u64 {
    1
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            chain_id: 1,
            data_dir: PathBuf::from("./kestrel-data"),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            validator_key: None,
            genesis: Vec::new(),
            consensus: ConsensusConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The signing key; a node without one cannot take part in consensus
    pub fn validator_keypair(&self) -> Result<KeyPair> {
        let key_hex = self
            .validator_key
            .as_deref()
            .ok_or_else(|| anyhow!("validator_key is required to run a node"))?;
        let secret = SecretKey::from_hex(key_hex).context("invalid validator_key")?;
        let public = secret.public_key();
        Ok(KeyPair { secret, public })
    }

    pub fn genesis_config(&self) -> Result<GenesisConfig> {
        if self.genesis.is_empty() {
            bail!("genesis validator set is empty");
        }
        let validators = self
            .genesis
            .iter()
            .map(|entry| {
                let public_key = PublicKey::from_hex(&entry.public_key)
                    .with_context(|| format!("invalid genesis key {}", entry.public_key))?;
                Ok(Validator::new(public_key, entry.voting_power))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(GenesisConfig {
            chain_id: self.chain_id,
            validators,
        })
    }

    /// Peer base URLs by validator address
    pub fn peer_endpoints(&self) -> Result<HashMap<Address, String>> {
        self.genesis
            .iter()
            .map(|entry| {
                let public_key = PublicKey::from_hex(&entry.public_key)?;
                Ok((
                    public_key.address(),
                    entry.endpoint.trim_end_matches('/').to_string(),
                ))
            })
            .collect()
    }
}

/// Configurations for `count` validators listening on consecutive ports,
/// sharing one genesis
pub fn generate_testnet_configs(count: u16, base_port: u16, manual: bool) -> Vec<NodeConfig> {
    let keys: Vec<KeyPair> = (0..count).map(|_| KeyPair::generate()).collect();
    let port_of = |i: usize| base_port.saturating_add(i as u16);
    let genesis: Vec<GenesisValidator> = keys
        .iter()
        .enumerate()
        .map(|(i, kp)| GenesisValidator {
            public_key: kp.public.to_hex(),
            voting_power: 1,
            endpoint: format!("http://127.0.0.1:{}", port_of(i)),
        })
        .collect();

    keys.iter()
        .enumerate()
        .map(|(i, kp)| NodeConfig {
            data_dir: PathBuf::from(format!("./kestrel-data/node-{}", i)),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], port_of(i))),
            validator_key: Some(kp.secret.to_hex()),
            genesis: genesis.clone(),
            consensus: ConsensusConfig {
                pacemaker: PacemakerConfig {
                    manual_mode: manual,
                    ..PacemakerConfig::default()
                },
                ..ConsensusConfig::default()
            },
            ..NodeConfig::default()
        })
        .collect()
}
