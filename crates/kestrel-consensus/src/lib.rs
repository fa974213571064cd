//! Kestrel Consensus - HotStuff BFT consensus core
//!
//! This crate provides the consensus state machine (NewRound, Prepare,
//! PreCommit, Commit, Decide), the pacemaker driving round timeouts,
//! round-robin leader election, quorum certificate aggregation and the
//! message pipeline. All state of a node is owned by a single worker task
//! fed through a bounded event queue.

pub mod config;
#[cfg(any(test, feature = "debug-control"))]
pub mod debug;
pub mod error;
pub mod event;
pub mod interfaces;
pub mod leader;
pub mod message;
pub mod pacemaker;
pub mod pipeline;
pub mod qc;
pub mod state_machine;
#[cfg(any(test, feature = "debug-control"))]
pub mod testing;
pub mod validators;
pub mod worker;

pub use config::ConsensusConfig;
#[cfg(any(test, feature = "debug-control"))]
pub use debug::DebugCommand;
pub use error::{CollaboratorError, ConsensusError};
pub use event::ConsensusEvent;
pub use interfaces::{BlockApplier, BlockProducer, BlockStore, Proposal, Signer, Transport, Verifier};
pub use leader::{LeaderElector, RoundRobinElector};
pub use message::{ConsensusMessage, StateSyncMessage};
pub use pacemaker::{Pacemaker, PacemakerConfig};
pub use pipeline::{MessagePipeline, Outbound};
pub use qc::{is_byzantine_threshold_met, quorum_threshold, validate_quorum_certificate, AddOutcome, QcAccumulator};
pub use state_machine::{Collaborators, ConsensusStateMachine};
pub use validators::{ValidatorSchedule, ValidatorSetView};
pub use worker::{spawn_consensus, ConsensusHandle};
