pub mod block;
pub mod hotstuff;
pub mod validator;

pub use block::{tx_hash, Block, BlockHeader, GenesisConfig};
pub use hotstuff::{
    ConsensusNodeState, HotstuffMessage, MessageType, PartialSignature, QuorumCertificate, Step,
    ThresholdSignature, View, VoteDigest,
};
pub use validator::{Validator, ValidatorSet};
