use kestrel_core::{Block, Step, View};
use tracing::warn;

use super::ConsensusStateMachine;
use crate::debug::DebugCommand;

impl ConsensusStateMachine {
    pub fn apply_debug(&mut self, command: DebugCommand) {
        warn!(command = ?command, "Applying debug override");
        match command {
            DebugCommand::SetHeight(height) => self.set_height(height),
            DebugCommand::SetRound(round) => self.set_round(round),
            DebugCommand::SetStep(step) => self.set_step(step),
            DebugCommand::SetBlock(block) => self.set_block(block),
        }
    }

    /// Jump to `height`, clearing per-height state. The leader is re-derived
    /// on the next catch up.
    pub fn set_height(&mut self, height: u64) {
        let view = self.view();
        self.pacemaker
            .override_view(View::new(height, view.round, view.step));
        self.locked_qc = None;
        self.high_qc = None;
        self.votes.clear();
        self.release_block();
        self.leader_id = None;
        self.validators_height = None;
        if let Err(err) = self.refresh_validators() {
            warn!(height, "{}", err);
        }
    }

    pub fn set_round(&mut self, round: u64) {
        let view = self.view();
        self.pacemaker
            .override_view(View::new(view.height, round, view.step));
        self.votes.clear();
        self.leader_id = None;
    }

    pub fn set_step(&mut self, step: Step) {
        let view = self.view();
        self.pacemaker
            .override_view(View::new(view.height, view.round, step));
    }

    pub fn set_block(&mut self, block: Option<Block>) {
        self.release_block();
        self.block = block;
    }
}
