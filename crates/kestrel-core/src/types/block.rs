use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, merkle_root, Address, Hash};
use crate::error::CoreError;
use crate::serialize;
use crate::types::hotstuff::QuorumCertificate;
use crate::types::validator::Validator;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (0 for genesis)
    pub height: u64,
    /// Address of the leader that proposed the block
    pub proposer_address: Address,
    /// State hash after the previous block
    pub prev_state_hash: Hash,
    /// State hash after applying this block's transactions
    pub state_hash: Hash,
    /// Number of transactions
    pub num_txs: u32,
    /// Merkle root of transaction hashes
    pub tx_root: Hash,
}

impl BlockHeader {
    /// Compute the hash of this header
    pub fn hash(&self) -> Result<Hash, CoreError> {
        let bytes = serialize::to_bytes(self)?;
        Ok(hash_blake3(&bytes))
    }
}

/// A complete block.
///
/// The block hash covers the header only; the quorum certificate is attached
/// once the block has been decided and does not change its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
    pub quorum_certificate: Option<QuorumCertificate>,
}

/// Hash of an opaque transaction
pub fn tx_hash(tx: &[u8]) -> Hash {
    hash_blake3(tx)
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Vec<u8>>) -> Self {
        Block {
            header,
            transactions,
            quorum_certificate: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Compute the block hash (hash of header)
    pub fn hash(&self) -> Result<Hash, CoreError> {
        self.header.hash()
    }

    pub fn compute_tx_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx_hash(tx)).collect();
        merkle_root(&hashes)
    }

    /// Check that `num_txs` and `tx_root` describe the carried transactions
    pub fn verify_tx_root(&self) -> bool {
        self.header.num_txs as usize == self.transactions.len()
            && self.compute_tx_root() == self.header.tx_root
    }

    /// Encoded size in bytes
    pub fn size_bytes(&self) -> Result<u64, CoreError> {
        serialize::encoded_len(self)
    }

    pub fn with_quorum_certificate(mut self, qc: QuorumCertificate) -> Self {
        self.quorum_certificate = Some(qc);
        self
    }
}

/// Genesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub validators: Vec<Validator>,
}

impl GenesisConfig {
    /// Create the genesis block (height 0, no transactions, zero state)
    pub fn create_genesis_block(&self) -> Block {
        let header = BlockHeader {
            height: 0,
            proposer_address: Address::default(),
            prev_state_hash: Hash::ZERO,
            state_hash: Hash::ZERO,
            num_txs: 0,
            tx_root: Hash::ZERO,
        };

        Block::new(header, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::hotstuff::{Step, ThresholdSignature, View};

    fn create_test_block(txs: Vec<Vec<u8>>) -> Block {
        let proposer = KeyPair::generate();
        let hashes: Vec<Hash> = txs.iter().map(|tx| tx_hash(tx)).collect();
        let header = BlockHeader {
            height: 1,
            proposer_address: proposer.address(),
            prev_state_hash: Hash::ZERO,
            state_hash: hash_blake3(b"state"),
            num_txs: txs.len() as u32,
            tx_root: merkle_root(&hashes),
        };
        Block::new(header, txs)
    }

    #[test]
    fn test_block_hash_ignores_qc() {
        let block = create_test_block(vec![b"a".to_vec()]);
        let hash = block.hash().unwrap();
        let certified = block
            .clone()
            .with_quorum_certificate(QuorumCertificate::new(
                View::new(1, 0, Step::Commit),
                hash,
                ThresholdSignature::default(),
            ));
        assert_eq!(certified.hash().unwrap(), hash);
    }

    #[test]
    fn test_tx_root_verification() {
        let mut block = create_test_block(vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(block.verify_tx_root());
        block.transactions.push(b"c".to_vec());
        assert!(!block.verify_tx_root());
    }

    #[test]
    fn test_genesis_block() {
        let config = GenesisConfig {
            chain_id: 1,
            validators: vec![Validator::new(KeyPair::generate().public, 1)],
        };
        let genesis = config.create_genesis_block();
        assert_eq!(genesis.height(), 0);
        assert!(genesis.transactions.is_empty());
        assert!(genesis.verify_tx_root());
    }
}
