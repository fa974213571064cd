//! The HotStuff phase state machine.
//!
//! Sans-IO: handlers mutate local state and push [`Outbound`] messages into
//! an outbox which the worker flushes through the [`MessagePipeline`]
//! after every event.
//!
//! [`MessagePipeline`]: crate::pipeline::MessagePipeline

#[cfg(any(test, feature = "debug-control"))]
mod debug;
mod leader;
mod replica;
mod sync;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use kestrel_core::{
    Address, Block, ConsensusNodeState, Hash, HotstuffMessage, MessageType, PartialSignature,
    QuorumCertificate, Step, ValidatorSet, View,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::event::ConsensusEvent;
use crate::interfaces::{BlockApplier, BlockProducer, BlockStore, Signer, Verifier};
use crate::leader::{LeaderElector, RoundRobinElector};
use crate::message::ConsensusMessage;
use crate::pacemaker::Pacemaker;
use crate::pipeline::{self, Outbound, Relevance, Route};
use crate::qc::{validate_quorum_certificate, QcAccumulator};
use crate::validators::ValidatorSetView;

/// External capabilities the state machine is built from
pub struct Collaborators {
    pub signer: Arc<dyn Signer>,
    pub validators: Arc<dyn ValidatorSetView>,
    pub producer: Box<dyn BlockProducer>,
    pub applier: Box<dyn BlockApplier>,
    pub store: Arc<dyn BlockStore>,
    pub elector: Box<dyn LeaderElector>,
}

impl Collaborators {
    /// Collaborators with round-robin leader election
    pub fn new(
        signer: Arc<dyn Signer>,
        validators: Arc<dyn ValidatorSetView>,
        producer: Box<dyn BlockProducer>,
        applier: Box<dyn BlockApplier>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        Collaborators {
            signer,
            validators,
            producer,
            applier,
            store,
            elector: Box::new(RoundRobinElector),
        }
    }

    pub fn with_elector(mut self, elector: Box<dyn LeaderElector>) -> Self {
        self.elector = elector;
        self
    }
}

/// Partial-signature accumulators of the current view, plus the highest
/// justification seen in NewRound votes
#[derive(Default)]
struct VotePool {
    accumulators: HashMap<(View, Hash), QcAccumulator>,
    best_justification: Option<QuorumCertificate>,
}

impl VotePool {
    fn accumulator(
        &mut self,
        view: View,
        block_hash: Hash,
        validators: &Arc<ValidatorSet>,
    ) -> Result<&mut QcAccumulator, ConsensusError> {
        match self.accumulators.entry((view, block_hash)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(QcAccumulator::new(
                view,
                block_hash,
                Arc::clone(validators),
            )?)),
        }
    }

    fn offer_justification(&mut self, qc: QuorumCertificate) {
        let newer = match &self.best_justification {
            Some(best) => qc.is_newer_than(best),
            None => true,
        };
        if newer {
            self.best_justification = Some(qc);
        }
    }

    fn clear(&mut self) {
        self.accumulators.clear();
        self.best_justification = None;
    }
}

pub struct ConsensusStateMachine {
    config: ConsensusConfig,
    address: Address,
    signer: Arc<dyn Signer>,
    validator_view: Arc<dyn ValidatorSetView>,
    validators: Arc<ValidatorSet>,
    /// Height `validators` was resolved for; participation stalls while it
    /// lags the current height
    validators_height: Option<u64>,
    elector: Box<dyn LeaderElector>,
    producer: Box<dyn BlockProducer>,
    applier: Box<dyn BlockApplier>,
    store: Arc<dyn BlockStore>,
    pacemaker: Pacemaker,
    leader_id: Option<Address>,
    locked_qc: Option<QuorumCertificate>,
    high_qc: Option<QuorumCertificate>,
    /// Block voted on at the current height
    block: Option<Block>,
    /// Hash of the block currently staged in the applier
    applied: Option<Hash>,
    votes: VotePool,
    future: VecDeque<HotstuffMessage>,
    /// Height a state-sync request was broadcast for
    sync_requested: Option<u64>,
    outbox: Vec<Outbound>,
}

impl ConsensusStateMachine {
    /// Build a state machine positioned at (start_height, 0, NewRound).
    ///
    /// Fails if the validator set for `start_height` cannot be resolved.
    pub fn new(
        config: ConsensusConfig,
        collaborators: Collaborators,
        start_height: u64,
        events: Option<mpsc::Sender<ConsensusEvent>>,
    ) -> Result<Self, ConsensusError> {
        let validators = collaborators.validators.get_validators(start_height)?;
        let address = collaborators.signer.address();
        if !validators.contains(&address) {
            warn!(address = %address, "Node is not in the validator set, it will only observe");
        }

        let pacemaker = Pacemaker::new(
            config.pacemaker.clone(),
            View::new(start_height, 0, Step::NewRound),
            events,
        );

        Ok(ConsensusStateMachine {
            config,
            address,
            signer: collaborators.signer,
            validator_view: collaborators.validators,
            validators,
            validators_height: Some(start_height),
            elector: collaborators.elector,
            producer: collaborators.producer,
            applier: collaborators.applier,
            store: collaborators.store,
            pacemaker,
            leader_id: None,
            locked_qc: None,
            high_qc: None,
            block: None,
            applied: None,
            votes: VotePool::default(),
            future: VecDeque::new(),
            sync_requested: None,
            outbox: Vec::new(),
        })
    }

    /// Arm the pacemaker and enter the first view
    pub fn start(&mut self) {
        self.pacemaker.start();
        self.start_next_view(false);
    }

    pub fn shutdown(&mut self) {
        self.pacemaker.stop();
        self.release_block();
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn view(&self) -> View {
        self.pacemaker.view()
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn node_state(&self) -> ConsensusNodeState {
        let view = self.pacemaker.view();
        ConsensusNodeState {
            node_address: self.address,
            height: view.height,
            round: view.round,
            step: view.step,
            leader_id: self.leader_id,
            is_leader: self.is_leader(),
            locked_qc: self.locked_qc.clone(),
            high_qc: self.high_qc.clone(),
        }
    }

    /// Drain messages produced since the last call
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Entry point for every inbound envelope. Never fails: per-message
    /// errors are logged and the message dropped.
    pub fn handle_message(&mut self, message: ConsensusMessage) {
        let result = match message {
            ConsensusMessage::Hotstuff(msg) => self.handle_hotstuff(msg),
            ConsensusMessage::StateSync(msg) => self.handle_state_sync(msg),
        };
        if let Err(err) = result {
            self.log_drop(&err);
        }
    }

    /// Timer expiry posted by the pacemaker
    pub fn handle_timeout(&mut self, height: u64, round: u64, generation: u64) {
        if !self.pacemaker.is_current_timer(height, round, generation) {
            debug!(height, round, generation, "Ignoring stale timer");
            return;
        }
        self.interrupt_round("timeout", false);
    }

    /// Explicit timeout trigger; broadcasts NewRound even in manual mode
    pub fn force_timeout(&mut self) {
        self.interrupt_round("forced timeout", true);
    }

    /// Broadcast NewRound for the current view, or for the next round if the
    /// current one is already past NewRound
    pub fn trigger_next_view(&mut self) {
        info!(view = %self.view(), "Triggering next view");
        if self.view().step == Step::NewRound {
            self.start_next_view(true);
        } else {
            self.interrupt_round("next view triggered", true);
        }
    }

    fn handle_hotstuff(&mut self, msg: HotstuffMessage) -> Result<(), ConsensusError> {
        let current = self.view();
        let route = pipeline::route(&msg)?;

        match pipeline::classify(current, &msg) {
            Relevance::Stale => {
                return Err(ConsensusError::StaleMessage {
                    height: msg.height,
                    round: msg.round,
                    step: msg.step,
                })
            }
            Relevance::FutureHeight => {
                self.buffer_future(msg);
                return Ok(());
            }
            Relevance::Current => {
                self.refresh_validators()?;
                self.verify_sender(&msg)?;
                if msg.msg_type == MessageType::Propose {
                    self.check_proposer(&msg)?;
                }
            }
            Relevance::CatchUp => {
                if !self.pacemaker.within_reach(msg.view()) {
                    return Err(ConsensusError::RoundOutOfReach {
                        round: msg.round,
                        current: current.round,
                    });
                }
                self.refresh_validators()?;
                self.verify_sender(&msg)?;
                match route {
                    Route::PrepareProposal | Route::QuorumProposal => self.check_proposer(&msg)?,
                    Route::NewRoundVote if msg.round > current.round => {}
                    _ => return Err(ConsensusError::UnexpectedMessage { step: msg.step }),
                }
                self.catch_up(msg.view());
            }
        }

        if msg.msg_type == MessageType::Propose && msg.sender() == Some(&self.address) {
            // The leader already advanced when it proposed
            debug!(step = %msg.step, "Dropping self proposal");
            return Ok(());
        }

        match route {
            Route::NewRoundVote => self.on_new_round_vote(msg),
            Route::PrepareProposal => self.on_prepare_proposal(msg),
            Route::QuorumProposal => self.on_quorum_proposal(msg),
            Route::PhaseVote => self.on_phase_vote(msg),
        }
    }

    /// Authenticate the signer against the current validator set
    fn verify_sender(&self, msg: &HotstuffMessage) -> Result<(), ConsensusError> {
        let partial = msg
            .signature
            .as_ref()
            .ok_or(ConsensusError::MissingSignature)?;
        if !self.validators.contains(&partial.signer_address) {
            return Err(ConsensusError::UnknownValidator(partial.signer_address));
        }
        let digest = msg.signing_hash()?;
        if !self
            .validators
            .verify(&partial.signer_address, digest.as_bytes(), &partial.signature)
        {
            return Err(ConsensusError::InvalidPartialSignature(
                partial.signer_address,
            ));
        }
        Ok(())
    }

    /// Proposals are only accepted from the leader of their own view
    fn check_proposer(&self, msg: &HotstuffMessage) -> Result<(), ConsensusError> {
        let leader = self.elector.leader_for_view(&self.validators, msg.view());
        match msg.sender() {
            Some(sender) if Some(*sender) == leader => Ok(()),
            Some(sender) => Err(ConsensusError::WrongLeader {
                sender: *sender,
                leader,
            }),
            None => Err(ConsensusError::MissingSignature),
        }
    }

    /// Adopt a later view observed in a message. A new round abandons the
    /// current one: votes, staged block and leader are reset. Landing on
    /// NewRound of a later round also casts our own NewRound vote.
    fn catch_up(&mut self, observed: View) {
        let previous = self.view();
        if !self.pacemaker.catch_up(observed) {
            return;
        }
        info!(from = %previous, to = %observed, "Pacemaker catching up");
        if observed.round == previous.round {
            if self.leader_id.is_none() {
                self.elect_leader();
            }
        } else if observed.step == Step::NewRound {
            self.start_next_view(false);
        } else {
            self.votes.clear();
            self.release_block();
            self.elect_leader();
        }
    }

    /// Resolve the validator set of the current height if not done yet
    fn refresh_validators(&mut self) -> Result<(), ConsensusError> {
        let height = self.view().height;
        if self.validators_height == Some(height) {
            return Ok(());
        }
        self.validators = self.validator_view.get_validators(height)?;
        self.validators_height = Some(height);
        debug!(height, validators = self.validators.len(), "Validator set resolved");
        Ok(())
    }

    fn elect_leader(&mut self) {
        let view = self.view();
        self.leader_id = self.elector.leader_for_view(&self.validators, view);
        match self.leader_id {
            Some(leader) if leader == self.address => {
                info!(height = view.height, round = view.round, "Elected as leader");
            }
            Some(leader) => {
                debug!(height = view.height, round = view.round, leader = %leader, "Leader elected");
            }
            None => error!(height = view.height, "No leader: validator set is empty"),
        }
    }

    fn is_leader(&self) -> bool {
        self.leader_id == Some(self.address)
    }

    /// Reset the round to NewRound bookkeeping and, unless in manual mode,
    /// broadcast a NewRound vote carrying our high QC
    fn start_next_view(&mut self, force: bool) {
        self.votes.clear();
        self.release_block();
        if let Err(err) = self.refresh_validators() {
            self.leader_id = None;
            error!(view = %self.view(), "{}, not participating", err);
            return;
        }
        self.elect_leader();

        if self.pacemaker.is_manual() && !force {
            debug!(view = %self.view(), "Manual mode, waiting for trigger");
            return;
        }

        let view = View::new(self.view().height, self.view().round, Step::NewRound);
        let vote = HotstuffMessage::new(MessageType::Vote, view, None, self.high_qc.clone());
        match self.sign(vote) {
            Ok(vote) => self.broadcast(vote.into()),
            Err(err) => error!("Failed to sign NewRound vote: {}", err),
        }
    }

    /// Abandon the current round and move to the next one
    fn interrupt_round(&mut self, reason: &str, force: bool) {
        warn!(view = %self.view(), reason, "Interrupting round");
        self.pacemaker.on_timeout();
        self.sync_requested = None;
        self.start_next_view(force);
    }

    /// Leave a decided height behind and enter (height + 1, 0, NewRound)
    fn new_height(&mut self) {
        self.locked_qc = None;
        self.high_qc = None;
        self.block = None;
        self.release_block();

        let Some(view) = self.pacemaker.new_height() else {
            error!(height = self.view().height, "Height counter exhausted");
            return;
        };
        if self.sync_requested.is_some_and(|h| h < view.height) {
            self.sync_requested = None;
        }

        self.start_next_view(false);
        self.replay_future();
    }

    /// Stage `block` in the applier unless it is already staged
    fn ensure_applied(&mut self, block: &Block) -> Result<(), ConsensusError> {
        let hash = block.hash()?;
        if self.applied == Some(hash) {
            return Ok(());
        }
        self.release_block();
        self.applier
            .apply_block(block)
            .map_err(ConsensusError::collaborator)?;
        self.applied = Some(hash);
        Ok(())
    }

    fn release_block(&mut self) {
        if self.applied.take().is_some() {
            self.applier.release();
        }
    }

    /// Check a QC used as justification in the current height
    fn validate_justification(
        &self,
        qc: &QuorumCertificate,
        expected_step: Step,
    ) -> Result<(), ConsensusError> {
        let height = self.view().height;
        if qc.height != height {
            return Err(ConsensusError::InvalidQuorumCertificate(format!(
                "QC for height {} at height {}",
                qc.height, height
            )));
        }
        if qc.step != expected_step {
            return Err(ConsensusError::InvalidQuorumCertificate(format!(
                "expected {} QC, got {}",
                expected_step, qc.step
            )));
        }
        validate_quorum_certificate(qc, &self.validators)
    }

    /// A high QC justifies a proposal: a Prepare QC, or the PreCommit QC of
    /// a replica that joined its round at Commit
    fn validate_high_qc(&self, qc: &QuorumCertificate) -> Result<(), ConsensusError> {
        match qc.step {
            Step::Prepare | Step::PreCommit => self.validate_justification(qc, qc.step),
            step => Err(ConsensusError::InvalidQuorumCertificate(format!(
                "{} QC cannot justify a proposal",
                step
            ))),
        }
    }

    /// Structural checks on a proposed block
    fn validate_block(&self, block: &Block, proposer: &Address) -> Result<(), ConsensusError> {
        let height = self.view().height;
        if block.height() != height {
            return Err(ConsensusError::InvalidBlock(format!(
                "block height {} at height {}",
                block.height(),
                height
            )));
        }
        if &block.header.proposer_address != proposer {
            return Err(ConsensusError::InvalidBlock(
                "proposer address does not match leader".to_string(),
            ));
        }
        if !block.verify_tx_root() {
            return Err(ConsensusError::InvalidBlock(
                "transaction root mismatch".to_string(),
            ));
        }
        let size = block.size_bytes()?;
        if size > self.config.max_block_bytes {
            return Err(ConsensusError::InvalidBlock(format!(
                "{} bytes exceeds limit of {}",
                size, self.config.max_block_bytes
            )));
        }
        Ok(())
    }

    /// Send our vote for `block` at `view` to the current leader
    fn vote_for(&mut self, view: View, block: &Block) -> Result<(), ConsensusError> {
        let leader = self.leader_id.ok_or(ConsensusError::WrongLeader {
            sender: self.address,
            leader: None,
        })?;
        let vote = self.sign(HotstuffMessage::new(
            MessageType::Vote,
            view,
            Some(block.clone()),
            None,
        ))?;
        debug!(step = %view.step, leader = %leader, "Voting");
        self.send(leader, vote.into());
        Ok(())
    }

    fn sign(&self, mut msg: HotstuffMessage) -> Result<HotstuffMessage, ConsensusError> {
        let digest = msg.signing_hash()?;
        msg.signature = Some(PartialSignature {
            signer_address: self.address,
            signature: self.signer.sign(digest.as_bytes()),
        });
        Ok(msg)
    }

    fn broadcast(&mut self, message: ConsensusMessage) {
        self.outbox.push(Outbound::Broadcast(message));
    }

    fn send(&mut self, to: Address, message: ConsensusMessage) {
        self.outbox.push(Outbound::Send { to, message });
    }

    fn log_drop(&self, err: &ConsensusError) {
        let view = self.view();
        if err.is_benign() {
            debug!(height = view.height, round = view.round, step = %view.step, "Dropping message: {}", err);
        } else if err.is_fatal() {
            error!(height = view.height, round = view.round, step = %view.step, "{}", err);
        } else {
            warn!(height = view.height, round = view.round, step = %view.step, "Rejected message: {}", err);
        }
    }
}
