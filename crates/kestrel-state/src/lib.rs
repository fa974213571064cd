//! Kestrel State - Chain storage and block execution
//!
//! Reference implementations of the collaborators the consensus core
//! consumes: a block store with validator-set history, a transaction pool,
//! and the producer/applier pair that turns pooled transactions into
//! blocks and commits decided ones.

pub mod chain;
pub mod error;
pub mod executor;
pub mod pool;
pub mod storage;

pub use chain::ChainStore;
pub use error::StateError;
pub use executor::{next_state_hash, BlockBuilder, BlockExecutor};
pub use pool::{PoolConfig, TxPool};
pub use storage::{FileStorage, MemoryStorage, Storage};
