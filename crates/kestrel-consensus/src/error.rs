use kestrel_core::{Address, Hash, Step};
use thiserror::Error;

/// Failure reported by a collaborator (transport, block production,
/// block application or storage)
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Stale message for ({height}, {round}, {step})")]
    StaleMessage { height: u64, round: u64, step: Step },

    #[error("Message from {sender} but leader is {leader:?}")]
    WrongLeader {
        sender: Address,
        leader: Option<Address>,
    },

    #[error("Unexpected {step} message in this phase")]
    UnexpectedMessage { step: Step },

    #[error("Message is not signed")]
    MissingSignature,

    #[error("Invalid partial signature from {0}")]
    InvalidPartialSignature(Address),

    #[error("Unknown validator: {0}")]
    UnknownValidator(Address),

    #[error("Insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    #[error("Invalid quorum certificate: {0}")]
    InvalidQuorumCertificate(String),

    #[error("Round {round} is out of reach from round {current}")]
    RoundOutOfReach { round: u64, current: u64 },

    #[error("Proposal for block {0} violates the locking rule")]
    UnsafeProposal(Hash),

    #[error("Validator set unavailable for height {0}")]
    ValidatorSetUnavailable(u64),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Missing validator key")]
    MissingValidatorKey,

    #[error("Consensus worker stopped")]
    WorkerStopped,

    #[error("Core error: {0}")]
    Core(#[from] kestrel_core::CoreError),
}

impl ConsensusError {
    /// Configuration or resource failures that must abort startup.
    ///
    /// Everything else is a per-message condition that is logged and dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::ValidatorSetUnavailable(_)
                | ConsensusError::MissingValidatorKey
                | ConsensusError::WorkerStopped
        )
    }

    /// Drops that happen during normal operation and only warrant `debug!`
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ConsensusError::StaleMessage { .. }
                | ConsensusError::UnexpectedMessage { .. }
                | ConsensusError::WrongLeader { .. }
        )
    }

    pub(crate) fn collaborator(err: CollaboratorError) -> Self {
        ConsensusError::Collaborator(err.to_string())
    }
}
