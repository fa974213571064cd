//! Future-height buffering and block backfill.

use kestrel_core::{Address, Block, HotstuffMessage, Step};
use tracing::{debug, info, warn};

use super::ConsensusStateMachine;
use crate::error::ConsensusError;
use crate::message::StateSyncMessage;
use crate::qc::validate_quorum_certificate;

impl ConsensusStateMachine {
    /// Keep a message from a later height and ask peers for the block we miss
    pub(super) fn buffer_future(&mut self, msg: HotstuffMessage) {
        if self.future.len() >= self.config.max_future_messages {
            self.future.pop_front();
            warn!(
                capacity = self.config.max_future_messages,
                "Future message buffer full, dropping oldest"
            );
        }
        debug!(height = msg.height, round = msg.round, step = %msg.step, "Buffering future message");
        self.future.push_back(msg);

        let height = self.view().height;
        if self.sync_requested != Some(height) {
            self.sync_requested = Some(height);
            info!(height, "Behind the network, requesting block");
            self.broadcast(
                StateSyncMessage::BlockRequest {
                    height,
                    requester: self.address,
                }
                .into(),
            );
        }
    }

    /// Re-run buffered messages in arrival order after a height change
    pub(super) fn replay_future(&mut self) {
        if self.future.is_empty() {
            return;
        }
        let pending: Vec<HotstuffMessage> = self.future.drain(..).collect();
        debug!(count = pending.len(), "Replaying buffered messages");
        for msg in pending {
            if let Err(err) = self.handle_hotstuff(msg) {
                self.log_drop(&err);
            }
        }
    }

    pub(super) fn handle_state_sync(
        &mut self,
        msg: StateSyncMessage,
    ) -> Result<(), ConsensusError> {
        match msg {
            StateSyncMessage::BlockRequest { height, requester } => {
                self.answer_block_request(height, requester)
            }
            StateSyncMessage::BlockResponse { block } => self.apply_synced_block(block),
        }
    }

    fn answer_block_request(&mut self, height: u64, requester: Address) -> Result<(), ConsensusError> {
        if requester == self.address || height >= self.view().height {
            return Ok(());
        }
        match self.store.get_block(height).map_err(ConsensusError::collaborator)? {
            Some(block) => {
                debug!(height, requester = %requester, "Serving block");
                self.send(requester, StateSyncMessage::BlockResponse { block }.into());
            }
            None => debug!(height, "Requested block not found"),
        }
        Ok(())
    }

    /// Commit a block decided by the network, proven by its Commit QC
    fn apply_synced_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        let height = self.view().height;
        if block.height() != height {
            return Err(ConsensusError::StaleMessage {
                height: block.height(),
                round: 0,
                step: Step::Decide,
            });
        }

        let qc = block
            .quorum_certificate
            .clone()
            .ok_or_else(|| ConsensusError::InvalidQuorumCertificate("synced block without QC".to_string()))?;
        if qc.step != Step::Commit || qc.height != height || qc.block_hash != block.hash()? {
            return Err(ConsensusError::InvalidQuorumCertificate(
                "synced block QC does not certify the block".to_string(),
            ));
        }
        let validators = self.validator_view.get_validators(height)?;
        validate_quorum_certificate(&qc, &validators)?;
        if !block.verify_tx_root() {
            return Err(ConsensusError::InvalidBlock(
                "transaction root mismatch".to_string(),
            ));
        }

        info!(height, block = %qc.block_hash.short(), "Applying synced block");
        self.release_block();
        self.ensure_applied(&block)?;
        self.block = Some(block);
        self.decide(qc)
    }
}
