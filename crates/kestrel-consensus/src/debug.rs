//! Direct state overrides for test harnesses.
//!
//! Compiled only for tests or with the `debug-control` feature; production
//! builds have no way to move the consensus pointer except through the
//! protocol.

use kestrel_core::{Block, Step};

#[derive(Debug, Clone)]
pub enum DebugCommand {
    SetHeight(u64),
    SetRound(u64),
    SetStep(Step),
    SetBlock(Option<Block>),
}
