use kestrel_core::ConsensusNodeState;
use tokio::sync::oneshot;

use crate::message::ConsensusMessage;

#[cfg(any(test, feature = "debug-control"))]
use crate::debug::DebugCommand;

/// Everything the consensus worker reacts to, in arrival order
#[derive(Debug)]
pub enum ConsensusEvent {
    /// A decoded envelope from the network
    Message(ConsensusMessage),
    /// Posted by the pacemaker timer; stale unless all three fields match
    Timeout {
        height: u64,
        round: u64,
        generation: u64,
    },
    /// Broadcast NewRound for the current view regardless of timer state
    TriggerNextView,
    /// Expire the current round now; the timeout entry point in manual mode
    ForceTimeout,
    GetState(oneshot::Sender<ConsensusNodeState>),
    #[cfg(any(test, feature = "debug-control"))]
    Debug(DebugCommand),
    Shutdown,
}
