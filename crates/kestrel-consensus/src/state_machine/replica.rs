//! Replica side: proposal validation, the locking rule and Decide.

use kestrel_core::{Address, Block, Hash, HotstuffMessage, QuorumCertificate, Step};
use tracing::{debug, error, info};

use super::ConsensusStateMachine;
use crate::error::ConsensusError;

impl ConsensusStateMachine {
    /// Validate the leader's block, apply it speculatively and vote Prepare
    pub(super) fn on_prepare_proposal(
        &mut self,
        msg: HotstuffMessage,
    ) -> Result<(), ConsensusError> {
        let proposer = msg
            .sender()
            .copied()
            .ok_or(ConsensusError::MissingSignature)?;
        let block = msg
            .block
            .ok_or_else(|| ConsensusError::InvalidBlock("missing block".to_string()))?;
        self.validate_block(&block, &proposer)?;
        let block_hash = block.hash()?;

        if let Some(qc) = &msg.justification {
            self.validate_high_qc(qc)?;
            if qc.block_hash != block_hash {
                return Err(ConsensusError::InvalidQuorumCertificate(
                    "justification certifies a different block".to_string(),
                ));
            }
        }
        self.check_safety(block_hash, msg.justification.as_ref())?;

        self.ensure_applied(&block)?;
        if let Some(qc) = msg.justification {
            self.update_high_qc(qc);
        }

        let view = self.view();
        self.vote_for(view, &block)?;
        self.block = Some(block);
        self.pacemaker.advance_step(Step::PreCommit);
        Ok(())
    }

    /// PreCommit, Commit and Decide proposals: each carries the QC of the
    /// previous phase for the block being decided
    pub(super) fn on_quorum_proposal(
        &mut self,
        msg: HotstuffMessage,
    ) -> Result<(), ConsensusError> {
        let expected = match msg.step {
            Step::PreCommit => Step::Prepare,
            Step::Commit => Step::PreCommit,
            Step::Decide => Step::Commit,
            step => return Err(ConsensusError::UnexpectedMessage { step }),
        };
        let qc = msg
            .justification
            .clone()
            .ok_or_else(|| ConsensusError::InvalidQuorumCertificate("missing".to_string()))?;
        self.validate_justification(&qc, expected)?;
        if qc.round != msg.round {
            return Err(ConsensusError::InvalidQuorumCertificate(format!(
                "QC from round {} in round {}",
                qc.round, msg.round
            )));
        }

        let proposer = msg
            .sender()
            .copied()
            .ok_or(ConsensusError::MissingSignature)?;
        let block = self.adopt_block(qc.block_hash, msg.block, &proposer)?;
        let view = self.view();

        match msg.step {
            Step::PreCommit => {
                self.update_high_qc(qc);
                self.vote_for(view, &block)?;
                self.pacemaker.advance_step(Step::Commit);
                Ok(())
            }
            Step::Commit => {
                // A PreCommit QC is at least as new as any high QC we hold
                self.update_high_qc(qc.clone());
                self.locked_qc = Some(qc);
                self.vote_for(view, &block)?;
                self.pacemaker.advance_step(Step::Decide);
                Ok(())
            }
            _ => {
                // Two chained QCs: our lock (PreCommit QC) and this Commit QC
                let chained = self
                    .locked_qc
                    .as_ref()
                    .is_some_and(|locked| locked.block_hash == qc.block_hash);
                if !chained {
                    return Err(ConsensusError::UnsafeProposal(qc.block_hash));
                }
                self.decide(qc)
            }
        }
    }

    /// Locking rule: accept if unlocked, locked on this block, or the
    /// justification is from a later round than the lock
    pub(super) fn check_safety(
        &self,
        block_hash: Hash,
        justification: Option<&QuorumCertificate>,
    ) -> Result<(), ConsensusError> {
        let Some(locked) = &self.locked_qc else {
            return Ok(());
        };
        if locked.block_hash == block_hash {
            return Ok(());
        }
        match justification {
            Some(qc) if qc.round > locked.round => Ok(()),
            _ => Err(ConsensusError::UnsafeProposal(block_hash)),
        }
    }

    /// The block certified by `block_hash`: the one we hold, or the one
    /// carried by the proposal when we joined the round late
    fn adopt_block(
        &mut self,
        block_hash: Hash,
        carried: Option<Block>,
        proposer: &Address,
    ) -> Result<Block, ConsensusError> {
        if let Some(block) = self.block.clone() {
            if block.hash()? == block_hash {
                self.ensure_applied(&block)?;
                return Ok(block);
            }
        }

        let block = carried
            .ok_or_else(|| ConsensusError::InvalidBlock("certified block unknown".to_string()))?;
        if block.hash()? != block_hash {
            return Err(ConsensusError::InvalidBlock(
                "carried block does not match QC".to_string(),
            ));
        }
        self.validate_block(&block, proposer)?;
        debug!(block = %block_hash.short(), "Adopting certified block");
        self.ensure_applied(&block)?;
        self.block = Some(block.clone());
        Ok(block)
    }

    fn update_high_qc(&mut self, qc: QuorumCertificate) {
        let newer = match &self.high_qc {
            Some(high) => qc.is_newer_than(high),
            None => true,
        };
        if newer {
            self.high_qc = Some(qc);
        }
    }

    /// Commit the staged block with its Commit QC and move to the next height
    pub(super) fn decide(&mut self, commit_qc: QuorumCertificate) -> Result<(), ConsensusError> {
        let block = self
            .block
            .clone()
            .ok_or_else(|| ConsensusError::InvalidBlock("nothing to decide".to_string()))?;
        self.ensure_applied(&block)?;

        if let Err(err) = self.applier.commit(&commit_qc) {
            error!(height = block.height(), "Commit failed: {}", err);
            self.interrupt_round("commit failed", false);
            return Err(ConsensusError::collaborator(err));
        }
        // The applier consumed the staged block
        self.applied = None;

        info!(
            height = block.height(),
            round = commit_qc.round,
            block = %commit_qc.block_hash.short(),
            txs = block.transactions.len(),
            "Committed block"
        );
        self.new_height();
        Ok(())
    }
}
