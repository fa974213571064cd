//! Block production from the pool and the apply/commit unit of work.

use std::sync::Arc;

use kestrel_consensus::{BlockApplier, BlockProducer, CollaboratorError, Proposal};
use kestrel_core::{hash_pair, merkle_root, tx_hash, Block, Hash, QuorumCertificate};
use tracing::{debug, info};

use crate::chain::ChainStore;
use crate::error::StateError;
use crate::pool::TxPool;
use crate::storage::Storage;

/// Encoded size of a block without transactions, with headroom for the QC tag
pub const BLOCK_OVERHEAD_BYTES: u64 = 256;

/// State transition: the new state commits to the previous one and the
/// ordered transactions of the block
pub fn next_state_hash(prev_state_hash: &Hash, tx_root: &Hash) -> Hash {
    hash_pair(prev_state_hash, tx_root)
}

fn expect_next_height<S: Storage>(store: &ChainStore<S>, height: u64) -> Result<(), StateError> {
    let expected = store.height()? + 1;
    if height != expected {
        return Err(StateError::UnexpectedHeight {
            expected,
            got: height,
        });
    }
    Ok(())
}

/// Fills proposals with pooled transactions
pub struct BlockBuilder<S: Storage> {
    store: Arc<ChainStore<S>>,
    pool: Arc<TxPool>,
}

impl<S: Storage> BlockBuilder<S> {
    pub fn new(store: Arc<ChainStore<S>>, pool: Arc<TxPool>) -> Self {
        BlockBuilder { store, pool }
    }

    pub fn build(&self, height: u64, max_bytes: u64) -> Result<Proposal, StateError> {
        expect_next_height(&self.store, height)?;
        let prev_state_hash = self.store.head_state()?;
        let transactions = self
            .pool
            .select(max_bytes.saturating_sub(BLOCK_OVERHEAD_BYTES))?;
        let hashes: Vec<Hash> = transactions.iter().map(|tx| tx_hash(tx)).collect();
        let state_hash = next_state_hash(&prev_state_hash, &merkle_root(&hashes));

        debug!(height, txs = transactions.len(), "Built proposal");
        Ok(Proposal {
            prev_state_hash,
            state_hash,
            transactions,
        })
    }
}

impl<S: Storage> BlockProducer for BlockBuilder<S> {
    fn create_proposal(&mut self, height: u64, max_bytes: u64) -> Result<Proposal, CollaboratorError> {
        Ok(self.build(height, max_bytes)?)
    }
}

/// Stages one block at a time and appends it to the chain on commit
pub struct BlockExecutor<S: Storage> {
    store: Arc<ChainStore<S>>,
    pool: Arc<TxPool>,
    staged: Option<(Hash, Block)>,
}

impl<S: Storage> BlockExecutor<S> {
    pub fn new(store: Arc<ChainStore<S>>, pool: Arc<TxPool>) -> Self {
        BlockExecutor {
            store,
            pool,
            staged: None,
        }
    }

    pub fn staged_hash(&self) -> Option<Hash> {
        self.staged.as_ref().map(|(hash, _)| *hash)
    }

    /// Check that `block` extends the head and that its state hash follows
    pub fn stage(&mut self, block: &Block) -> Result<Hash, StateError> {
        expect_next_height(&self.store, block.height())?;
        let head_state = self.store.head_state()?;
        if block.header.prev_state_hash != head_state {
            return Err(StateError::PrevStateMismatch {
                expected: head_state,
                got: block.header.prev_state_hash,
            });
        }
        if !block.verify_tx_root() {
            return Err(StateError::InvalidTxRoot);
        }
        let expected = next_state_hash(&head_state, &block.header.tx_root);
        if expected != block.header.state_hash {
            return Err(StateError::StateHashMismatch {
                expected,
                got: block.header.state_hash,
            });
        }

        let hash = block.hash()?;
        self.staged = Some((hash, block.clone()));
        debug!(height = block.height(), block = %hash.short(), "Staged block");
        Ok(hash)
    }

    pub fn finalize(&mut self, commit_qc: &QuorumCertificate) -> Result<Block, StateError> {
        let (hash, block) = self.staged.take().ok_or(StateError::NoPendingBlock)?;
        if commit_qc.block_hash != hash {
            let err = StateError::PendingBlockMismatch {
                certified: commit_qc.block_hash,
                staged: hash,
            };
            self.staged = Some((hash, block));
            return Err(err);
        }

        let block = block.with_quorum_certificate(commit_qc.clone());
        self.store.append_block(block.clone())?;
        self.pool.remove_committed(&block.transactions);
        info!(
            height = block.height(),
            block = %hash.short(),
            txs = block.transactions.len(),
            "Block committed to chain"
        );
        Ok(block)
    }
}

impl<S: Storage> BlockApplier for BlockExecutor<S> {
    fn apply_block(&mut self, block: &Block) -> Result<(), CollaboratorError> {
        self.stage(block)?;
        Ok(())
    }

    fn commit(&mut self, commit_qc: &QuorumCertificate) -> Result<(), CollaboratorError> {
        self.finalize(commit_qc)?;
        Ok(())
    }

    fn release(&mut self) {
        if let Some((hash, _)) = self.staged.take() {
            debug!(block = %hash.short(), "Released staged block");
        }
    }
}
