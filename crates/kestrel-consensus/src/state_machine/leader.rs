//! Leader side: NewRound aggregation, proposals and per-phase QC formation.

use kestrel_core::{
    merkle_root, tx_hash, Block, BlockHeader, Hash, HotstuffMessage, MessageType,
    QuorumCertificate, Step,
};
use tracing::{debug, info};

use super::ConsensusStateMachine;
use crate::error::ConsensusError;
use crate::qc::AddOutcome;

impl ConsensusStateMachine {
    /// Count a NewRound vote. Replicas and the leader both accumulate them;
    /// on quorum the leader proposes and replicas wait in Prepare.
    pub(super) fn on_new_round_vote(&mut self, msg: HotstuffMessage) -> Result<(), ConsensusError> {
        if let Some(qc) = &msg.justification {
            self.validate_high_qc(qc)?;
        }

        let view = msg.view();
        let partial = msg
            .signature
            .clone()
            .ok_or(ConsensusError::MissingSignature)?;
        let signer = partial.signer_address;
        let validators = self.validators.clone();
        let accumulator = self.votes.accumulator(view, Hash::ZERO, &validators)?;
        match accumulator.add_partial_signature(partial) {
            AddOutcome::Accepted => {}
            AddOutcome::Duplicate => return Ok(()),
            AddOutcome::Invalid => return Err(ConsensusError::InvalidPartialSignature(signer)),
        }
        let quorum = accumulator.has_quorum();

        if let Some(qc) = msg.justification {
            self.votes.offer_justification(qc);
        }

        if !quorum || self.view().step != Step::NewRound {
            return Ok(());
        }

        if self.is_leader() {
            self.propose()
        } else {
            debug!(view = %view, "NewRound quorum reached, waiting for proposal");
            self.pacemaker.advance_step(Step::Prepare);
            Ok(())
        }
    }

    /// Broadcast the Prepare proposal and vote for it ourselves.
    ///
    /// Re-proposes the block of the highest Prepare QC when we still hold it;
    /// otherwise asks the producer for a fresh block.
    fn propose(&mut self) -> Result<(), ConsensusError> {
        let high_qc = self.newest_high_qc();
        if let Some(qc) = &high_qc {
            self.high_qc = Some(qc.clone());
        }

        let held = match (&high_qc, &self.block) {
            (Some(qc), Some(block)) if block.hash()? == qc.block_hash => Some(block.clone()),
            _ => None,
        };

        let (block, justification) = match held {
            Some(block) => {
                info!(height = block.height(), "Re-proposing block of highest Prepare QC");
                (block, high_qc)
            }
            None => match self.build_block() {
                Ok(block) => (block, None),
                Err(err) => {
                    self.interrupt_round("block proposal failed", false);
                    return Err(err);
                }
            },
        };

        if let Err(err) = self.ensure_applied(&block) {
            self.interrupt_round("applying own proposal failed", false);
            return Err(err);
        }
        self.block = Some(block.clone());
        self.pacemaker.advance_step(Step::Prepare);

        let view = self.view();
        let proposal = self.sign(HotstuffMessage::new(
            MessageType::Propose,
            view,
            Some(block.clone()),
            justification,
        ))?;
        info!(
            height = view.height,
            round = view.round,
            block = %block.hash()?.short(),
            txs = block.transactions.len(),
            "Proposing block"
        );
        self.broadcast(proposal.into());
        self.vote_for(view, &block)
    }

    fn newest_high_qc(&self) -> Option<QuorumCertificate> {
        match (&self.high_qc, &self.votes.best_justification) {
            (Some(own), Some(seen)) if seen.is_newer_than(own) => Some(seen.clone()),
            (Some(own), _) => Some(own.clone()),
            (None, seen) => seen.clone(),
        }
    }

    fn build_block(&mut self) -> Result<Block, ConsensusError> {
        let height = self.view().height;
        let proposal = self
            .producer
            .create_proposal(height, self.config.max_block_bytes)
            .map_err(ConsensusError::collaborator)?;

        let hashes: Vec<Hash> = proposal.transactions.iter().map(|tx| tx_hash(tx)).collect();
        let header = BlockHeader {
            height,
            proposer_address: self.address,
            prev_state_hash: proposal.prev_state_hash,
            state_hash: proposal.state_hash,
            num_txs: proposal.transactions.len() as u32,
            tx_root: merkle_root(&hashes),
        };
        let block = Block::new(header, proposal.transactions);

        let size = block.size_bytes()?;
        if size > self.config.max_block_bytes {
            return Err(ConsensusError::InvalidBlock(format!(
                "producer returned {} bytes, limit is {}",
                size, self.config.max_block_bytes
            )));
        }
        Ok(block)
    }

    /// Aggregate a Prepare, PreCommit or Commit vote; on quorum form the QC
    /// and drive the next phase
    pub(super) fn on_phase_vote(&mut self, msg: HotstuffMessage) -> Result<(), ConsensusError> {
        let partial = msg
            .signature
            .clone()
            .ok_or(ConsensusError::MissingSignature)?;
        let signer = partial.signer_address;
        if !self.is_leader() {
            return Err(ConsensusError::WrongLeader {
                sender: signer,
                leader: self.leader_id,
            });
        }

        let block_hash = match &self.block {
            Some(block) => block.hash()?,
            None => {
                return Err(ConsensusError::InvalidBlock(
                    "vote received without an active proposal".to_string(),
                ))
            }
        };
        if msg.block_hash()? != block_hash {
            return Err(ConsensusError::InvalidBlock(
                "vote for a different block".to_string(),
            ));
        }

        let view = msg.view();
        let current_step = self.view().step;
        let validators = self.validators.clone();
        let accumulator = self.votes.accumulator(view, block_hash, &validators)?;
        match accumulator.add_partial_signature(partial) {
            AddOutcome::Accepted => {}
            AddOutcome::Duplicate => return Ok(()),
            AddOutcome::Invalid => return Err(ConsensusError::InvalidPartialSignature(signer)),
        }
        if !accumulator.has_quorum() || current_step != msg.step {
            return Ok(());
        }
        let qc = accumulator.build()?;
        info!(
            height = view.height,
            round = view.round,
            step = %view.step,
            signers = qc.signer_count(),
            "Quorum certificate formed"
        );

        match msg.step {
            Step::Prepare => {
                self.high_qc = Some(qc.clone());
                self.advance_and_propose(Step::PreCommit, qc)
            }
            Step::PreCommit => {
                self.locked_qc = Some(qc.clone());
                self.advance_and_propose(Step::Commit, qc)
            }
            Step::Commit => {
                self.pacemaker.advance_step(Step::Decide);
                self.broadcast_proposal(qc.clone())?;
                self.decide(qc)
            }
            step => Err(ConsensusError::UnexpectedMessage { step }),
        }
    }

    fn advance_and_propose(
        &mut self,
        step: Step,
        justification: QuorumCertificate,
    ) -> Result<(), ConsensusError> {
        self.pacemaker.advance_step(step);
        let block = self.broadcast_proposal(justification)?;
        self.vote_for(self.view(), &block)
    }

    /// Broadcast the current block justified by `qc` at the current view
    fn broadcast_proposal(&mut self, qc: QuorumCertificate) -> Result<Block, ConsensusError> {
        let block = self
            .block
            .clone()
            .ok_or_else(|| ConsensusError::InvalidBlock("no block to propose".to_string()))?;
        let proposal = self.sign(HotstuffMessage::new(
            MessageType::Propose,
            self.view(),
            Some(block.clone()),
            Some(qc),
        ))?;
        self.broadcast(proposal.into());
        Ok(block)
    }
}
