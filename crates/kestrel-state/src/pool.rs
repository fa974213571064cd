//! Pending transactions awaiting block production.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use kestrel_core::{tx_hash, Hash};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StateError;

/// Bincode length prefix of each transaction inside a block
pub const TX_LENGTH_PREFIX_BYTES: u64 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of pooled transactions
    pub max_size: usize,
    /// Maximum size of a single transaction in bytes
    pub max_tx_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 10_000,
            max_tx_bytes: 64 * 1024,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Arrival order
    order: VecDeque<Hash>,
    by_hash: HashMap<Hash, Vec<u8>>,
}

/// FIFO pool of opaque transactions, deduplicated by hash
pub struct TxPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl TxPool {
    pub fn new(config: PoolConfig) -> Self {
        TxPool {
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolInner>, StateError> {
        self.inner.lock().map_err(|_| StateError::LockPoisoned)
    }

    pub fn add(&self, tx: Vec<u8>) -> Result<Hash, StateError> {
        if tx.len() > self.config.max_tx_bytes {
            return Err(StateError::TransactionTooLarge {
                size: tx.len(),
                max: self.config.max_tx_bytes,
            });
        }
        let hash = tx_hash(&tx);
        let mut inner = self.lock()?;
        if inner.by_hash.contains_key(&hash) {
            return Err(StateError::DuplicateTransaction(hash));
        }
        if inner.by_hash.len() >= self.config.max_size {
            return Err(StateError::PoolFull(self.config.max_size));
        }
        inner.by_hash.insert(hash, tx);
        inner.order.push_back(hash);
        debug!(tx = %hash.short(), pooled = inner.by_hash.len(), "Pooled transaction");
        Ok(hash)
    }

    /// Oldest transactions whose summed encoded size stays within `max_bytes`.
    ///
    /// Selection stops at the first transaction that does not fit so that
    /// arrival order is preserved.
    pub fn select(&self, max_bytes: u64) -> Result<Vec<Vec<u8>>, StateError> {
        let inner = self.lock()?;
        let mut selected = Vec::new();
        let mut used = 0u64;
        for hash in &inner.order {
            let Some(tx) = inner.by_hash.get(hash) else {
                continue;
            };
            let size = tx.len() as u64 + TX_LENGTH_PREFIX_BYTES;
            if used + size > max_bytes {
                break;
            }
            used += size;
            selected.push(tx.clone());
        }
        Ok(selected)
    }

    /// Drop transactions included in a committed block
    pub fn remove_committed(&self, transactions: &[Vec<u8>]) {
        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(err) => {
                warn!("Cannot prune pool: {}", err);
                return;
            }
        };
        let mut removed = 0;
        for tx in transactions {
            if inner.by_hash.remove(&tx_hash(tx)).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            let PoolInner { order, by_hash } = &mut *inner;
            order.retain(|hash| by_hash.contains_key(hash));
            debug!(removed, remaining = by_hash.len(), "Pruned committed transactions");
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.lock()
            .map(|inner| inner.by_hash.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.by_hash.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TxPool {
    fn default() -> Self {
        TxPool::new(PoolConfig::default())
    }
}
