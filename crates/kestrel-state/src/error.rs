use kestrel_core::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Chain store has no genesis block")]
    NotInitialized,

    #[error("Chain id mismatch: stored {stored}, configured {configured}")]
    ChainIdMismatch { stored: u64, configured: u64 },

    #[error("Block not found at height {0}")]
    BlockNotFound(u64),

    #[error("Unexpected block height: expected {expected}, got {got}")]
    UnexpectedHeight { expected: u64, got: u64 },

    #[error("Previous state mismatch: head is {expected}, block builds on {got}")]
    PrevStateMismatch { expected: Hash, got: Hash },

    #[error("State hash mismatch: computed {expected}, block claims {got}")]
    StateHashMismatch { expected: Hash, got: Hash },

    #[error("Transaction root does not match block body")]
    InvalidTxRoot,

    #[error("No block is staged")]
    NoPendingBlock,

    #[error("Commit certificate is for {certified}, staged block is {staged}")]
    PendingBlockMismatch { certified: Hash, staged: Hash },

    #[error("Transaction pool is full ({0} entries)")]
    PoolFull(usize),

    #[error("Transaction already pooled: {0}")]
    DuplicateTransaction(Hash),

    #[error("Transaction of {size} bytes exceeds limit of {max}")]
    TransactionTooLarge { size: usize, max: usize },

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Core error: {0}")]
    Core(#[from] kestrel_core::CoreError),
}
