//! Ingress classification and egress dispatch of protocol messages.

use std::cmp::Ordering;
use std::sync::Arc;

use kestrel_core::{Address, HotstuffMessage, MessageType, Step, View};
use tracing::{trace, warn};

use crate::error::ConsensusError;
use crate::interfaces::Transport;
use crate::message::ConsensusMessage;

/// Where a message sits relative to the node's own view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    /// Below the current view; dropped
    Stale,
    /// Exactly the current view
    Current,
    /// Same height, later round or step; triggers pacemaker catch up
    CatchUp,
    /// A later height; buffered until the node has the missing blocks
    FutureHeight,
}

/// State-machine handler a well-formed message is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    NewRoundVote,
    PrepareProposal,
    /// PreCommit, Commit or Decide proposal justified by the previous phase's QC
    QuorumProposal,
    /// Prepare, PreCommit or Commit vote addressed to the leader
    PhaseVote,
}

/// Outbound message produced by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(ConsensusMessage),
    Send { to: Address, message: ConsensusMessage },
}

pub fn classify(current: View, message: &HotstuffMessage) -> Relevance {
    let observed = message.view();
    match observed.height.cmp(&current.height) {
        Ordering::Less => Relevance::Stale,
        Ordering::Greater => Relevance::FutureHeight,
        Ordering::Equal => match observed.cmp(&current) {
            Ordering::Less => Relevance::Stale,
            Ordering::Equal => Relevance::Current,
            Ordering::Greater => Relevance::CatchUp,
        },
    }
}

/// Check the message shape and pick its handler
pub fn route(message: &HotstuffMessage) -> Result<Route, ConsensusError> {
    if message.signature.is_none() {
        return Err(ConsensusError::MissingSignature);
    }

    match (message.msg_type, message.step) {
        (MessageType::Vote, Step::NewRound) => {
            if message.block.is_some() {
                return Err(ConsensusError::InvalidBlock(
                    "NewRound vote carries a block".to_string(),
                ));
            }
            Ok(Route::NewRoundVote)
        }
        (MessageType::Propose, Step::Prepare) => {
            if message.block.is_none() {
                return Err(ConsensusError::InvalidBlock(
                    "Prepare proposal without block".to_string(),
                ));
            }
            Ok(Route::PrepareProposal)
        }
        (MessageType::Propose, Step::PreCommit | Step::Commit | Step::Decide) => {
            if message.justification.is_none() {
                return Err(ConsensusError::InvalidQuorumCertificate(format!(
                    "{} proposal without justification",
                    message.step
                )));
            }
            Ok(Route::QuorumProposal)
        }
        (MessageType::Vote, Step::Prepare | Step::PreCommit | Step::Commit) => {
            if message.block.is_none() {
                return Err(ConsensusError::InvalidBlock(
                    "vote without block".to_string(),
                ));
            }
            Ok(Route::PhaseVote)
        }
        (_, step) => Err(ConsensusError::UnexpectedMessage { step }),
    }
}

/// Egress: serializes outbound messages and hands them to the transport
pub struct MessagePipeline {
    transport: Arc<dyn Transport>,
}

impl MessagePipeline {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        MessagePipeline { transport }
    }

    /// Decode an inbound envelope once, at the boundary
    pub fn decode(bytes: &[u8]) -> Result<ConsensusMessage, ConsensusError> {
        ConsensusMessage::decode(bytes)
    }

    pub fn dispatch(&self, outbox: Vec<Outbound>) {
        for outbound in outbox {
            match outbound {
                Outbound::Broadcast(message) => match message.encode() {
                    Ok(payload) => {
                        trace!(bytes = payload.len(), "Broadcasting consensus message");
                        self.transport.broadcast(payload);
                    }
                    Err(e) => warn!("Failed to encode broadcast: {}", e),
                },
                Outbound::Send { to, message } => match message.encode() {
                    Ok(payload) => {
                        trace!(to = %to, bytes = payload.len(), "Sending consensus message");
                        self.transport.send(&to, payload);
                    }
                    Err(e) => warn!("Failed to encode message for {}: {}", to, e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{Block, BlockHeader, Hash, PartialSignature, Sig};
    use std::sync::Mutex;

    fn signed(msg_type: MessageType, view: View, with_block: bool) -> HotstuffMessage {
        let block = with_block.then(|| {
            Block::new(
                BlockHeader {
                    height: view.height,
                    proposer_address: Address::default(),
                    prev_state_hash: Hash::ZERO,
                    state_hash: Hash::ZERO,
                    num_txs: 0,
                    tx_root: Hash::ZERO,
                },
                Vec::new(),
            )
        });
        let mut msg = HotstuffMessage::new(msg_type, view, block, None);
        msg.signature = Some(PartialSignature {
            signer_address: Address::default(),
            signature: Sig::default(),
        });
        msg
    }

    #[test]
    fn test_classify() {
        let current = View::new(3, 4, Step::Prepare);
        let at = |h, r, s| signed(MessageType::Vote, View::new(h, r, s), false);

        assert_eq!(classify(current, &at(2, 9, Step::Decide)), Relevance::Stale);
        assert_eq!(classify(current, &at(3, 3, Step::Decide)), Relevance::Stale);
        assert_eq!(classify(current, &at(3, 4, Step::NewRound)), Relevance::Stale);
        assert_eq!(classify(current, &at(3, 4, Step::Prepare)), Relevance::Current);
        assert_eq!(classify(current, &at(3, 4, Step::Commit)), Relevance::CatchUp);
        assert_eq!(classify(current, &at(3, 6, Step::NewRound)), Relevance::CatchUp);
        assert_eq!(classify(current, &at(4, 0, Step::NewRound)), Relevance::FutureHeight);
    }

    #[test]
    fn test_route() {
        let view = |s| View::new(1, 0, s);
        assert_eq!(
            route(&signed(MessageType::Vote, view(Step::NewRound), false)).unwrap(),
            Route::NewRoundVote
        );
        assert_eq!(
            route(&signed(MessageType::Propose, view(Step::Prepare), true)).unwrap(),
            Route::PrepareProposal
        );
        assert_eq!(
            route(&signed(MessageType::Vote, view(Step::Commit), true)).unwrap(),
            Route::PhaseVote
        );
        assert!(matches!(
            route(&signed(MessageType::Propose, view(Step::Prepare), false)),
            Err(ConsensusError::InvalidBlock(_))
        ));
        assert!(matches!(
            route(&signed(MessageType::Propose, view(Step::Commit), true)),
            Err(ConsensusError::InvalidQuorumCertificate(_))
        ));
        assert!(matches!(
            route(&signed(MessageType::Vote, view(Step::Decide), true)),
            Err(ConsensusError::UnexpectedMessage { step: Step::Decide })
        ));

        let mut unsigned = signed(MessageType::Vote, view(Step::NewRound), false);
        unsigned.signature = None;
        assert!(matches!(route(&unsigned), Err(ConsensusError::MissingSignature)));
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Option<Address>, Vec<u8>)>>,
    }

    impl Transport for RecordingTransport {
        fn broadcast(&self, payload: Vec<u8>) {
            self.sent.lock().unwrap().push((None, payload));
        }

        fn send(&self, to: &Address, payload: Vec<u8>) {
            self.sent.lock().unwrap().push((Some(*to), payload));
        }
    }

    #[test]
    fn test_dispatch_encodes_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let pipeline = MessagePipeline::new(transport.clone());
        let target = Address::new([7u8; 20]);

        let first = ConsensusMessage::from(signed(MessageType::Vote, View::new(1, 0, Step::NewRound), false));
        let second = ConsensusMessage::from(signed(MessageType::Vote, View::new(1, 0, Step::Prepare), true));
        pipeline.dispatch(vec![
            Outbound::Broadcast(first.clone()),
            Outbound::Send {
                to: target,
                message: second.clone(),
            },
        ]);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, None);
        assert_eq!(MessagePipeline::decode(&sent[0].1).unwrap(), first);
        assert_eq!(sent[1].0, Some(target));
        assert_eq!(MessagePipeline::decode(&sent[1].1).unwrap(), second);
    }
}
