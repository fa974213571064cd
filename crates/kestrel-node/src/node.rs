use std::sync::Arc;

use anyhow::{Context, Result};
use kestrel_consensus::{spawn_consensus, Collaborators};
use kestrel_core::KeyPair;
use kestrel_state::{BlockBuilder, BlockExecutor, ChainStore, FileStorage, TxPool};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::rpc::{create_router, AppState};
use crate::transport::HttpTransport;

/// The Kestrel validator node
pub struct Node {
    config: NodeConfig,
    keypair: KeyPair,
    store: Arc<ChainStore<FileStorage>>,
    pool: Arc<TxPool>,
}

impl Node {
    /// Open the chain in `data_dir` and make sure genesis is in place.
    ///
    /// A missing validator key is a startup error.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let keypair = config.validator_keypair()?;
        let genesis = config.genesis_config()?;
        if !genesis
            .validators
            .iter()
            .any(|v| v.public_key == keypair.public)
        {
            warn!("Validator key is not part of the genesis set");
        }

        let storage = FileStorage::open(config.data_dir.join("chain.db"))?;
        let store = Arc::new(ChainStore::open(storage)?);
        store.init_genesis(&genesis)?;
        let pool = Arc::new(TxPool::new(config.pool.clone()));

        Ok(Node {
            config,
            keypair,
            store,
            pool,
        })
    }

    /// Run consensus and the HTTP server until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let start_height = self.store.height()? + 1;
        info!(
            address = %self.keypair.address(),
            start_height,
            "Starting Kestrel node"
        );

        let transport = Arc::new(HttpTransport::new(self.config.peer_endpoints()?)?);
        let collaborators = Collaborators::new(
            Arc::new(self.keypair.clone()),
            self.store.clone(),
            Box::new(BlockBuilder::new(self.store.clone(), self.pool.clone())),
            Box::new(BlockExecutor::new(self.store.clone(), self.pool.clone())),
            self.store.clone(),
        );
        let (consensus, worker) = spawn_consensus(
            self.config.consensus.clone(),
            collaborators,
            transport,
            start_height,
        )
        .context("starting consensus")?;

        let router = create_router(Arc::new(AppState {
            chain_id: self.config.chain_id,
            consensus: consensus.clone(),
            store: self.store.clone(),
            pool: self.pool.clone(),
        }));

        let listen_addr = self.config.listen_addr;
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding {}", listen_addr))?;
        info!("HTTP server listening on {}", listen_addr);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
            })
            .await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        let _ = consensus.shutdown().await;
        worker.await.context("consensus worker panicked")?;
        served?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate_testnet_configs;

    fn config_in(name: &str) -> NodeConfig {
        let mut config = generate_testnet_configs(1, 0, true).remove(0);
        config.data_dir = std::env::temp_dir().join(format!(
            "kestrel-node-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_dir_all(&config.data_dir);
        config
    }

    #[test]
    fn test_node_initializes_genesis() {
        let config = config_in("genesis");
        let data_dir = config.data_dir.clone();
        let node = Node::new(config.clone()).unwrap();
        assert_eq!(node.store.height().unwrap(), 0);
        drop(node);

        // Reopening the same directory keeps the chain
        let node = Node::new(config).unwrap();
        assert_eq!(node.store.height().unwrap(), 0);
        let _ = std::fs::remove_dir_all(data_dir);
    }

    #[test]
    fn test_missing_validator_key_is_fatal() {
        let mut config = config_in("nokey");
        config.validator_key = None;
        assert!(Node::new(config).is_err());
    }
}
