//! In-process collaborators and an N-node network harness.
//!
//! Available to unit tests and, through the `debug-control` feature, to
//! integration tests and downstream crates.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kestrel_core::{
    hash_blake3, hash_pair, Address, Block, ConsensusNodeState, Hash, KeyPair, QuorumCertificate,
    ValidatorSet,
};
use tokio::task::JoinHandle;

use crate::config::ConsensusConfig;
use crate::debug::DebugCommand;
use crate::error::{CollaboratorError, ConsensusError};
use crate::interfaces::{BlockApplier, BlockProducer, BlockStore, Proposal, Transport};
use crate::message::ConsensusMessage;
use crate::state_machine::Collaborators;
use crate::validators::ValidatorSchedule;
use crate::worker::{spawn_consensus, ConsensusHandle};

/// Everything a node did to its chain
#[derive(Debug, Default)]
pub struct MemoryLedger {
    pub applied: Vec<Hash>,
    pub committed: BTreeMap<u64, Block>,
    pub released: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SharedLedger(Arc<Mutex<MemoryLedger>>);

impl SharedLedger {
    pub fn lock(&self) -> MutexGuard<'_, MemoryLedger> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn committed_hash(&self, height: u64) -> Option<Hash> {
        self.lock()
            .committed
            .get(&height)
            .and_then(|block| block.hash().ok())
    }

    /// State after the last committed block (zero before any commit)
    pub fn head_state(&self, below: u64) -> Hash {
        self.lock()
            .committed
            .range(..below)
            .next_back()
            .map(|(_, block)| block.header.state_hash)
            .unwrap_or(Hash::ZERO)
    }
}

/// Deterministic producer: one transaction per height
pub struct MemoryProducer {
    ledger: SharedLedger,
}

impl MemoryProducer {
    pub fn new(ledger: SharedLedger) -> Self {
        MemoryProducer { ledger }
    }
}

impl BlockProducer for MemoryProducer {
    fn create_proposal(&mut self, height: u64, _max_bytes: u64) -> Result<Proposal, CollaboratorError> {
        let prev_state_hash = self.ledger.head_state(height);
        let transactions = vec![format!("tx-{}", height).into_bytes()];
        let state_hash = hash_pair(&prev_state_hash, &hash_blake3(&transactions[0]));
        Ok(Proposal {
            prev_state_hash,
            state_hash,
            transactions,
        })
    }
}

/// Applier recording into a [`SharedLedger`]; accepts any block
pub struct MemoryApplier {
    ledger: SharedLedger,
    staged: Option<Block>,
}

impl MemoryApplier {
    pub fn new(ledger: SharedLedger) -> Self {
        MemoryApplier {
            ledger,
            staged: None,
        }
    }
}

impl BlockApplier for MemoryApplier {
    fn apply_block(&mut self, block: &Block) -> Result<(), CollaboratorError> {
        self.ledger.lock().applied.push(block.hash()?);
        self.staged = Some(block.clone());
        Ok(())
    }

    fn commit(&mut self, commit_qc: &QuorumCertificate) -> Result<(), CollaboratorError> {
        let block = self.staged.take().ok_or("nothing staged")?;
        if block.hash()? != commit_qc.block_hash {
            return Err("staged block does not match commit QC".into());
        }
        let height = block.height();
        self.ledger
            .lock()
            .committed
            .insert(height, block.with_quorum_certificate(commit_qc.clone()));
        Ok(())
    }

    fn release(&mut self) {
        if self.staged.take().is_some() {
            self.ledger.lock().released += 1;
        }
    }
}

impl BlockStore for SharedLedger {
    fn get_block(&self, height: u64) -> Result<Option<Block>, CollaboratorError> {
        Ok(self.lock().committed.get(&height).cloned())
    }
}

/// A message captured on the way out of a node
#[derive(Debug, Clone)]
pub struct Captured {
    pub from: Address,
    /// `None` for broadcasts
    pub to: Option<Address>,
    pub message: ConsensusMessage,
}

/// Transport appending decoded envelopes to a shared queue
pub struct CapturingTransport {
    from: Address,
    queue: Arc<Mutex<Vec<Captured>>>,
}

impl CapturingTransport {
    fn push(&self, to: Option<Address>, payload: Vec<u8>) {
        // Only this crate's own encoder feeds the transport
        if let Ok(message) = ConsensusMessage::decode(&payload) {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push(Captured {
                from: self.from,
                to,
                message,
            });
        }
    }
}

impl Transport for CapturingTransport {
    fn broadcast(&self, payload: Vec<u8>) {
        self.push(None, payload);
    }

    fn send(&self, to: &Address, payload: Vec<u8>) {
        self.push(Some(*to), payload);
    }
}

pub struct TestNode {
    pub keypair: KeyPair,
    pub handle: ConsensusHandle,
    pub ledger: SharedLedger,
    task: JoinHandle<()>,
}

impl TestNode {
    pub fn address(&self) -> Address {
        self.keypair.address()
    }
}

/// N validators wired through one capturing transport.
///
/// Nodes are ordered by address, so `nodes[i]` is validator index `i`.
/// Nothing is delivered until the test says so.
pub struct TestNetwork {
    pub nodes: Vec<TestNode>,
    pub validators: ValidatorSet,
    queue: Arc<Mutex<Vec<Captured>>>,
}

impl TestNetwork {
    /// Must be called inside a Tokio runtime
    pub fn new(size: u8, config: ConsensusConfig, start_height: u64) -> Result<Self, ConsensusError> {
        let mut keys: Vec<KeyPair> = (1..=size).map(KeyPair::from_seed_index).collect();
        keys.sort_by_key(|kp| kp.address());
        let publics: Vec<_> = keys.iter().map(|kp| kp.public).collect();
        let validators = ValidatorSet::from_public_keys(&publics);
        let schedule = Arc::new(ValidatorSchedule::new(0, validators.clone()));
        let queue = Arc::new(Mutex::new(Vec::new()));

        let mut nodes = Vec::with_capacity(keys.len());
        for keypair in keys {
            let ledger = SharedLedger::default();
            let collaborators = Collaborators::new(
                Arc::new(keypair.clone()),
                schedule.clone(),
                Box::new(MemoryProducer::new(ledger.clone())),
                Box::new(MemoryApplier::new(ledger.clone())),
                Arc::new(ledger.clone()),
            );
            let transport = Arc::new(CapturingTransport {
                from: keypair.address(),
                queue: Arc::clone(&queue),
            });
            let (handle, task) =
                spawn_consensus(config.clone(), collaborators, transport, start_height)?;
            nodes.push(TestNode {
                keypair,
                handle,
                ledger,
                task,
            });
        }

        Ok(TestNetwork {
            nodes,
            validators,
            queue,
        })
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.nodes.iter().position(|node| &node.address() == address)
    }

    /// Remove and return everything captured so far
    pub fn take_captured(&self) -> Vec<Captured> {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *queue)
    }

    /// Queue a message at its recipients: every node for a broadcast
    pub async fn deliver(&self, captured: &Captured) -> Result<(), ConsensusError> {
        for node in &self.nodes {
            if captured.to.map_or(true, |to| to == node.address()) {
                node.handle.submit(captured.message.clone()).await?;
            }
        }
        Ok(())
    }

    /// Queue a message at a single node if it is a recipient
    pub async fn deliver_to(&self, index: usize, captured: &Captured) -> Result<(), ConsensusError> {
        let node = &self.nodes[index];
        if captured.to.map_or(true, |to| to == node.address()) {
            node.handle.submit(captured.message.clone()).await?;
        }
        Ok(())
    }

    /// Wait until every node processed everything queued so far
    pub async fn settle(&self) -> Result<(), ConsensusError> {
        for node in &self.nodes {
            node.handle.node_state().await?;
        }
        Ok(())
    }

    pub async fn deliver_all(&self, batch: &[Captured]) -> Result<(), ConsensusError> {
        for captured in batch {
            self.deliver(captured).await?;
        }
        self.settle().await
    }

    /// Deliver captured traffic until none is produced; returns the count
    pub async fn run_until_quiet(&self, max_batches: usize) -> Result<usize, ConsensusError> {
        let mut delivered = 0;
        for _ in 0..max_batches {
            self.settle().await?;
            let batch = self.take_captured();
            if batch.is_empty() {
                break;
            }
            delivered += batch.len();
            self.deliver_all(&batch).await?;
        }
        Ok(delivered)
    }

    pub async fn trigger_next_view_all(&self) -> Result<(), ConsensusError> {
        for node in &self.nodes {
            node.handle.trigger_next_view().await?;
        }
        self.settle().await
    }

    pub async fn force_timeout_all(&self) -> Result<(), ConsensusError> {
        for node in &self.nodes {
            node.handle.force_timeout().await?;
        }
        self.settle().await
    }

    pub async fn debug_all(&self, command: DebugCommand) -> Result<(), ConsensusError> {
        for node in &self.nodes {
            node.handle.debug(command.clone()).await?;
        }
        self.settle().await
    }

    pub async fn states(&self) -> Result<Vec<ConsensusNodeState>, ConsensusError> {
        let mut states = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            states.push(node.handle.node_state().await?);
        }
        Ok(states)
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            let _ = node.handle.shutdown().await;
            let _ = node.task.await;
        }
    }
}
