//! Capabilities the consensus core consumes but does not implement.

use kestrel_core::{sign, verify, Address, Block, Hash, KeyPair, QuorumCertificate, Sig};
use kestrel_core::ValidatorSet;

use crate::error::CollaboratorError;

/// Fire-and-forget message delivery.
///
/// Implementations must not block the caller; delivery is best effort.
pub trait Transport: Send + Sync {
    /// Deliver an encoded envelope to every validator, including ourselves
    fn broadcast(&self, payload: Vec<u8>);

    /// Deliver an encoded envelope to a single validator
    fn send(&self, to: &Address, payload: Vec<u8>);
}

/// Block contents chosen by the producer for a new height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub prev_state_hash: Hash,
    pub state_hash: Hash,
    pub transactions: Vec<Vec<u8>>,
}

/// Builds proposals. Only invoked on the elected leader.
pub trait BlockProducer: Send {
    fn create_proposal(&mut self, height: u64, max_bytes: u64) -> Result<Proposal, CollaboratorError>;
}

/// Unit of work applying a block speculatively and committing it on Decide
pub trait BlockApplier: Send {
    /// Validate and stage `block`, replacing anything staged before
    fn apply_block(&mut self, block: &Block) -> Result<(), CollaboratorError>;

    /// Persist the staged block together with its Commit QC
    fn commit(&mut self, commit_qc: &QuorumCertificate) -> Result<(), CollaboratorError>;

    /// Discard the staged block, if any
    fn release(&mut self);
}

/// Committed block lookup, used to answer state-sync requests
pub trait BlockStore: Send + Sync {
    fn get_block(&self, height: u64) -> Result<Option<Block>, CollaboratorError>;
}

pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    fn sign(&self, message: &[u8]) -> Sig;
}

pub trait Verifier {
    /// Check `signature` against the key registered for `address`
    fn verify(&self, address: &Address, message: &[u8], signature: &Sig) -> bool;
}

impl Signer for KeyPair {
    fn address(&self) -> Address {
        KeyPair::address(self)
    }

    fn sign(&self, message: &[u8]) -> Sig {
        sign(&self.secret, message)
    }
}

impl Verifier for ValidatorSet {
    fn verify(&self, address: &Address, message: &[u8], signature: &Sig) -> bool {
        match self.get(address) {
            Some(validator) => verify(&validator.public_key, message, signature).is_ok(),
            None => false,
        }
    }
}
