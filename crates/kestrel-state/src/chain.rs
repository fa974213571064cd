//! Committed blocks by height and the validator-set history.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kestrel_consensus::{BlockStore, CollaboratorError, ConsensusError, ValidatorSetView};
use kestrel_core::{serialize, Block, GenesisConfig, Hash, ValidatorSet};
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::storage::Storage;

mod keys {
    pub const BLOCK: &[u8] = b"blk:";
    pub const VALIDATORS: &[u8] = b"vals:";
    pub const CHAIN_ID: &[u8] = b"chain:id";
    pub const HEAD: &[u8] = b"head";

    /// Big-endian heights keep prefix scans in height order
    pub fn block(height: u64) -> Vec<u8> {
        [BLOCK, &height.to_be_bytes()].concat()
    }

    pub fn validators(from_height: u64) -> Vec<u8> {
        [VALIDATORS, &from_height.to_be_bytes()].concat()
    }

    pub fn height_suffix(key: &[u8], prefix: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = key.strip_prefix(prefix)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

struct ChainInner<S> {
    storage: S,
    head: Option<Block>,
    schedule: BTreeMap<u64, Arc<ValidatorSet>>,
}

impl<S: Storage> ChainInner<S> {
    fn read_block(&self, height: u64) -> Result<Option<Block>, StateError> {
        match self.storage.get(&keys::block(height)) {
            Some(bytes) => Ok(Some(serialize::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn head(&self) -> Result<&Block, StateError> {
        self.head.as_ref().ok_or(StateError::NotInitialized)
    }

    /// Write a batch through `write`, rolling back if either step fails
    fn write_batch(
        &mut self,
        write: impl FnOnce(&mut S) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let result = write(&mut self.storage).and_then(|()| self.storage.commit());
        if result.is_err() {
            self.storage.rollback();
        }
        result
    }
}

/// Block store over a [`Storage`] backend.
///
/// Holds the head block and validator schedule in memory; everything is
/// persisted under the `blk:`, `vals:`, `chain:id` and `head` keys.
pub struct ChainStore<S: Storage> {
    inner: RwLock<ChainInner<S>>,
}

impl<S: Storage> ChainStore<S> {
    /// Load the head and validator schedule already in `storage`
    pub fn open(storage: S) -> Result<Self, StateError> {
        let mut inner = ChainInner {
            storage,
            head: None,
            schedule: BTreeMap::new(),
        };

        for (key, value) in inner.storage.scan_prefix(keys::VALIDATORS) {
            let Some(from_height) = keys::height_suffix(&key, keys::VALIDATORS) else {
                warn!("Skipping malformed validator-set key");
                continue;
            };
            let set: ValidatorSet = serialize::from_bytes(&value)?;
            inner.schedule.insert(from_height, Arc::new(set));
        }

        if let Some(bytes) = inner.storage.get(keys::HEAD) {
            let height: u64 = serialize::from_bytes(&bytes)?;
            let head = inner
                .read_block(height)?
                .ok_or(StateError::BlockNotFound(height))?;
            info!(height, sets = inner.schedule.len(), "Loaded chain from storage");
            inner.head = Some(head);
        }

        Ok(ChainStore {
            inner: RwLock::new(inner),
        })
    }

    /// Give back the backend, e.g. to reopen it
    pub fn into_storage(self) -> Result<S, StateError> {
        self.inner
            .into_inner()
            .map(|inner| inner.storage)
            .map_err(|_| StateError::LockPoisoned)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ChainInner<S>>, StateError> {
        self.inner.read().map_err(|_| StateError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ChainInner<S>>, StateError> {
        self.inner.write().map_err(|_| StateError::LockPoisoned)
    }

    /// Write the genesis block and initial validator set, or check that an
    /// existing chain was created for the same chain id
    pub fn init_genesis(&self, genesis: &GenesisConfig) -> Result<Block, StateError> {
        let mut inner = self.write()?;
        if let Some(bytes) = inner.storage.get(keys::CHAIN_ID) {
            let stored: u64 = serialize::from_bytes(&bytes)?;
            if stored != genesis.chain_id {
                return Err(StateError::ChainIdMismatch {
                    stored,
                    configured: genesis.chain_id,
                });
            }
            return inner.read_block(0)?.ok_or(StateError::BlockNotFound(0));
        }

        let block = genesis.create_genesis_block();
        let validators = ValidatorSet::new(genesis.validators.clone());
        let block_bytes = serialize::to_bytes(&block)?;
        let set_bytes = serialize::to_bytes(&validators)?;
        let chain_id = serialize::to_bytes(&genesis.chain_id)?;
        let head = serialize::to_bytes(&0u64)?;
        inner.write_batch(|storage| {
            storage.put(keys::CHAIN_ID, &chain_id);
            storage.put(&keys::block(0), &block_bytes);
            storage.put(&keys::validators(0), &set_bytes);
            storage.put(keys::HEAD, &head);
            Ok(())
        })?;

        info!(
            chain_id = genesis.chain_id,
            validators = validators.len(),
            "Initialized genesis"
        );
        inner.schedule.insert(0, Arc::new(validators));
        inner.head = Some(block.clone());
        Ok(block)
    }

    pub fn is_initialized(&self) -> bool {
        self.read().map(|inner| inner.head.is_some()).unwrap_or(false)
    }

    pub fn height(&self) -> Result<u64, StateError> {
        Ok(self.read()?.head()?.height())
    }

    pub fn head(&self) -> Result<Block, StateError> {
        Ok(self.read()?.head()?.clone())
    }

    /// State hash the next block must build on
    pub fn head_state(&self) -> Result<Hash, StateError> {
        Ok(self.read()?.head()?.header.state_hash)
    }

    pub fn block_at(&self, height: u64) -> Result<Option<Block>, StateError> {
        self.read()?.read_block(height)
    }

    /// Persist a decided block on top of the head
    pub fn append_block(&self, block: Block) -> Result<(), StateError> {
        let mut inner = self.write()?;
        let head = inner.head()?;
        let expected = head.height() + 1;
        if block.height() != expected {
            return Err(StateError::UnexpectedHeight {
                expected,
                got: block.height(),
            });
        }
        if block.header.prev_state_hash != head.header.state_hash {
            return Err(StateError::PrevStateMismatch {
                expected: head.header.state_hash,
                got: block.header.prev_state_hash,
            });
        }

        let height = block.height();
        let block_bytes = serialize::to_bytes(&block)?;
        let head_bytes = serialize::to_bytes(&height)?;
        inner.write_batch(|storage| {
            storage.put(&keys::block(height), &block_bytes);
            storage.put(keys::HEAD, &head_bytes);
            Ok(())
        })?;
        debug!(height, txs = block.transactions.len(), "Stored block");
        inner.head = Some(block);
        Ok(())
    }

    /// Schedule `set` to take effect at `from_height`
    pub fn schedule_validators(&self, from_height: u64, set: ValidatorSet) -> Result<(), StateError> {
        let mut inner = self.write()?;
        let bytes = serialize::to_bytes(&set)?;
        inner.write_batch(|storage| {
            storage.put(&keys::validators(from_height), &bytes);
            Ok(())
        })?;
        info!(from_height, validators = set.len(), "Scheduled validator set");
        inner.schedule.insert(from_height, Arc::new(set));
        Ok(())
    }

    /// The set in force at `height`: the latest one scheduled at or below it
    pub fn validators_at(&self, height: u64) -> Result<Option<Arc<ValidatorSet>>, StateError> {
        Ok(self
            .read()?
            .schedule
            .range(..=height)
            .next_back()
            .map(|(_, set)| Arc::clone(set)))
    }
}

impl<S: Storage> BlockStore for ChainStore<S> {
    fn get_block(&self, height: u64) -> Result<Option<Block>, CollaboratorError> {
        Ok(self.block_at(height)?)
    }
}

impl<S: Storage> ValidatorSetView for ChainStore<S> {
    fn get_validators(&self, height: u64) -> Result<Arc<ValidatorSet>, ConsensusError> {
        match self.validators_at(height) {
            Ok(Some(set)) if !set.is_empty() => Ok(set),
            Ok(_) => Err(ConsensusError::ValidatorSetUnavailable(height)),
            Err(err) => {
                warn!(height, "Validator set lookup failed: {}", err);
                Err(ConsensusError::ValidatorSetUnavailable(height))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use kestrel_core::{hash_blake3, Address, BlockHeader, KeyPair, Validator};

    fn genesis() -> GenesisConfig {
        GenesisConfig {
            chain_id: 9,
            validators: (1..=4)
                .map(|i| Validator::new(KeyPair::from_seed_index(i).public, 1))
                .collect(),
        }
    }

    fn child_of(parent: &Block) -> Block {
        Block::new(
            BlockHeader {
                height: parent.height() + 1,
                proposer_address: Address::default(),
                prev_state_hash: parent.header.state_hash,
                state_hash: hash_blake3(&parent.height().to_be_bytes()),
                num_txs: 0,
                tx_root: Hash::ZERO,
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_init_genesis() {
        let store = ChainStore::open(MemoryStorage::new()).unwrap();
        assert!(!store.is_initialized());
        assert!(matches!(store.height(), Err(StateError::NotInitialized)));

        let block = store.init_genesis(&genesis()).unwrap();
        assert_eq!(block.height(), 0);
        assert_eq!(store.height().unwrap(), 0);
        assert_eq!(store.head_state().unwrap(), Hash::ZERO);
        assert_eq!(store.get_validators(0).unwrap().len(), 4);

        // Re-initializing with the same chain id is a no-op
        assert_eq!(store.init_genesis(&genesis()).unwrap(), block);

        let mut other = genesis();
        other.chain_id = 10;
        assert!(matches!(
            store.init_genesis(&other),
            Err(StateError::ChainIdMismatch { stored: 9, configured: 10 })
        ));
    }

    #[test]
    fn test_append_enforces_chain() {
        let store = ChainStore::open(MemoryStorage::new()).unwrap();
        let genesis_block = store.init_genesis(&genesis()).unwrap();

        let first = child_of(&genesis_block);
        store.append_block(first.clone()).unwrap();
        assert_eq!(store.height().unwrap(), 1);
        assert_eq!(store.get_block(1).unwrap(), Some(first.clone()));

        // Same height again
        assert!(matches!(
            store.append_block(first.clone()),
            Err(StateError::UnexpectedHeight { expected: 2, got: 1 })
        ));

        let mut forked = child_of(&first);
        forked.header.prev_state_hash = hash_blake3(b"elsewhere");
        assert!(matches!(
            store.append_block(forked),
            Err(StateError::PrevStateMismatch { .. })
        ));
        assert!(store.get_block(2).unwrap().is_none());
    }

    #[test]
    fn test_validator_schedule() {
        let store = ChainStore::open(MemoryStorage::new()).unwrap();
        assert!(matches!(
            store.get_validators(0),
            Err(ConsensusError::ValidatorSetUnavailable(0))
        ));

        store.init_genesis(&genesis()).unwrap();
        let smaller = ValidatorSet::from_public_keys(&[KeyPair::from_seed_index(1).public]);
        store.schedule_validators(5, smaller).unwrap();

        assert_eq!(store.get_validators(4).unwrap().len(), 4);
        assert_eq!(store.get_validators(5).unwrap().len(), 1);
        assert_eq!(store.get_validators(50).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_restores_head_and_schedule() {
        let mut storage = MemoryStorage::new();
        {
            let store = ChainStore::open(storage.clone()).unwrap();
            let genesis_block = store.init_genesis(&genesis()).unwrap();
            store.append_block(child_of(&genesis_block)).unwrap();
            storage = store.into_storage().unwrap();
        }

        let reopened = ChainStore::open(storage).unwrap();
        assert_eq!(reopened.height().unwrap(), 1);
        assert_eq!(reopened.get_validators(1).unwrap().len(), 4);
    }
}
