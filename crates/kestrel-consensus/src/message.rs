use serde::{Deserialize, Serialize};

use kestrel_core::{serialize, Address, Block, HotstuffMessage};

use crate::error::ConsensusError;

/// Wire envelope carried by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Hotstuff(HotstuffMessage),
    StateSync(StateSyncMessage),
}

/// Block backfill for nodes that fell behind by a height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateSyncMessage {
    /// Ask peers for the committed block at `height`
    BlockRequest { height: u64, requester: Address },
    /// A committed block; its `quorum_certificate` is the Commit QC
    BlockResponse { block: Block },
}

impl ConsensusMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(serialize::to_bytes(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        Ok(serialize::from_bytes(bytes)?)
    }

    pub fn as_hotstuff(&self) -> Option<&HotstuffMessage> {
        match self {
            ConsensusMessage::Hotstuff(msg) => Some(msg),
            ConsensusMessage::StateSync(_) => None,
        }
    }
}

impl From<HotstuffMessage> for ConsensusMessage {
    fn from(msg: HotstuffMessage) -> Self {
        ConsensusMessage::Hotstuff(msg)
    }
}

impl From<StateSyncMessage> for ConsensusMessage {
    fn from(msg: StateSyncMessage) -> Self {
        ConsensusMessage::StateSync(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{MessageType, Step, View};

    #[test]
    fn test_envelope_roundtrip() {
        let msg = ConsensusMessage::from(HotstuffMessage::new(
            MessageType::Vote,
            View::new(4, 2, Step::NewRound),
            None,
            None,
        ));
        let bytes = msg.encode().unwrap();
        assert_eq!(ConsensusMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            ConsensusMessage::decode(&[0xff, 0xff, 0xff]),
            Err(ConsensusError::Core(_))
        ));
    }
}
