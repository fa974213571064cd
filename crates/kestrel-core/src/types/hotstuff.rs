//! HotStuff protocol data model: steps, views, messages, partial signatures
//! and quorum certificates.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{hash_blake3, Address, Hash, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::block::Block;

const VOTE_DOMAIN: &[u8] = b"kestrel/hotstuff/vote/v1";
const PROPOSAL_DOMAIN: &[u8] = b"kestrel/hotstuff/proposal/v1";

/// Consensus phase within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    NewRound,
    Prepare,
    PreCommit,
    Commit,
    Decide,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::NewRound,
        Step::Prepare,
        Step::PreCommit,
        Step::Commit,
        Step::Decide,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            Step::NewRound => 0,
            Step::Prepare => 1,
            Step::PreCommit => 2,
            Step::Commit => 3,
            Step::Decide => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, CoreError> {
        Step::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(CoreError::UnknownStep(ordinal))
    }

    /// The following phase, `None` after Decide
    pub fn next(self) -> Option<Step> {
        Step::from_ordinal(self.ordinal() + 1).ok()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A (height, round, step) pointer.
///
/// Field order matters: the derived ordering is lexicographic over height,
/// then round, then step ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct View {
    pub height: u64,
    pub round: u64,
    pub step: Step,
}

impl View {
    pub fn new(height: u64, round: u64, step: Step) -> Self {
        View {
            height,
            round,
            step,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.height, self.round, self.step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Propose,
    Vote,
}

/// One validator's signature over a canonical digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub signer_address: Address,
    pub signature: Sig,
}

/// Partial signatures ordered by signer address, at most one per signer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSignature {
    pub signatures: Vec<PartialSignature>,
}

impl ThresholdSignature {
    /// Build from signatures in any order; later duplicates of a signer are dropped
    pub fn from_signatures(signatures: impl IntoIterator<Item = PartialSignature>) -> Self {
        let mut signatures: Vec<PartialSignature> = signatures.into_iter().collect();
        signatures.sort_by(|a, b| a.signer_address.cmp(&b.signer_address));
        signatures.dedup_by(|a, b| a.signer_address == b.signer_address);
        ThresholdSignature { signatures }
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn signers(&self) -> impl Iterator<Item = &Address> {
        self.signatures.iter().map(|s| &s.signer_address)
    }
}

/// Canonical digest every vote and QC partial signature covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteDigest {
    pub height: u64,
    pub step: Step,
    pub round: u64,
    pub block_hash: Hash,
}

impl VoteDigest {
    pub fn new(view: View, block_hash: Hash) -> Self {
        VoteDigest {
            height: view.height,
            step: view.step,
            round: view.round,
            block_hash,
        }
    }

    /// Domain-separated hash of the digest fields
    pub fn hash(&self) -> Result<Hash, CoreError> {
        let mut bytes = VOTE_DOMAIN.to_vec();
        bytes.extend(serialize::to_bytes(self)?);
        Ok(hash_blake3(&bytes))
    }
}

/// Aggregated proof that a quorum voted for `block_hash` at a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub height: u64,
    pub round: u64,
    pub step: Step,
    pub block_hash: Hash,
    pub threshold_signature: ThresholdSignature,
}

impl QuorumCertificate {
    pub fn new(view: View, block_hash: Hash, threshold_signature: ThresholdSignature) -> Self {
        QuorumCertificate {
            height: view.height,
            round: view.round,
            step: view.step,
            block_hash,
            threshold_signature,
        }
    }

    pub fn view(&self) -> View {
        View::new(self.height, self.round, self.step)
    }

    pub fn digest(&self) -> VoteDigest {
        VoteDigest::new(self.view(), self.block_hash)
    }

    pub fn signer_count(&self) -> usize {
        self.threshold_signature.len()
    }

    /// Ordering used to pick the high QC: height, then round
    pub fn is_newer_than(&self, other: &QuorumCertificate) -> bool {
        (self.height, self.round) > (other.height, other.round)
    }
}

/// A proposal or vote exchanged between validators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotstuffMessage {
    pub msg_type: MessageType,
    pub height: u64,
    pub step: Step,
    pub round: u64,
    pub block: Option<Block>,
    pub justification: Option<QuorumCertificate>,
    pub signature: Option<PartialSignature>,
}

impl HotstuffMessage {
    /// An unsigned message; see [`HotstuffMessage::signing_hash`]
    pub fn new(
        msg_type: MessageType,
        view: View,
        block: Option<Block>,
        justification: Option<QuorumCertificate>,
    ) -> Self {
        HotstuffMessage {
            msg_type,
            height: view.height,
            step: view.step,
            round: view.round,
            block,
            justification,
            signature: None,
        }
    }

    pub fn view(&self) -> View {
        View::new(self.height, self.round, self.step)
    }

    /// Hash of the carried block, zero when there is none
    pub fn block_hash(&self) -> Result<Hash, CoreError> {
        match &self.block {
            Some(block) => block.hash(),
            None => Ok(Hash::ZERO),
        }
    }

    pub fn sender(&self) -> Option<&Address> {
        self.signature.as_ref().map(|s| &s.signer_address)
    }

    /// Bytes the sender signs.
    ///
    /// Votes sign the canonical [`VoteDigest`] so they can be aggregated into
    /// a QC unchanged. Proposals additionally bind the justification.
    pub fn signing_hash(&self) -> Result<Hash, CoreError> {
        let digest = VoteDigest::new(self.view(), self.block_hash()?);
        match self.msg_type {
            MessageType::Vote => digest.hash(),
            MessageType::Propose => {
                let mut bytes = PROPOSAL_DOMAIN.to_vec();
                bytes.extend(serialize::to_bytes(&(digest, &self.justification))?);
                Ok(hash_blake3(&bytes))
            }
        }
    }
}

/// Read-only snapshot of a node's consensus pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusNodeState {
    pub node_address: Address,
    pub height: u64,
    pub round: u64,
    pub step: Step,
    pub leader_id: Option<Address>,
    pub is_leader: bool,
    pub locked_qc: Option<QuorumCertificate>,
    pub high_qc: Option<QuorumCertificate>,
}

impl ConsensusNodeState {
    pub fn view(&self) -> View {
        View::new(self.height, self.round, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_ordering_is_lexicographic() {
        assert!(View::new(1, 5, Step::Decide) < View::new(2, 0, Step::NewRound));
        assert!(View::new(1, 0, Step::Decide) < View::new(1, 1, Step::NewRound));
        assert!(View::new(1, 1, Step::Prepare) < View::new(1, 1, Step::PreCommit));
    }

    #[test]
    fn test_step_ordinals() {
        for step in Step::ALL {
            assert_eq!(Step::from_ordinal(step.ordinal()).unwrap(), step);
        }
        assert_eq!(Step::Commit.next(), Some(Step::Decide));
        assert_eq!(Step::Decide.next(), None);
        assert!(matches!(Step::from_ordinal(9), Err(CoreError::UnknownStep(9))));
    }

    #[test]
    fn test_vote_digest_binds_every_field() {
        let base = VoteDigest::new(View::new(1, 0, Step::Prepare), hash_blake3(b"block"));
        let base_hash = base.hash().unwrap();

        let variants = [
            VoteDigest { height: 2, ..base },
            VoteDigest { round: 1, ..base },
            VoteDigest { step: Step::Commit, ..base },
            VoteDigest { block_hash: Hash::ZERO, ..base },
        ];
        for variant in variants {
            assert_ne!(variant.hash().unwrap(), base_hash);
        }
    }

    #[test]
    fn test_proposal_and_vote_hashes_differ() {
        let view = View::new(1, 0, Step::Prepare);
        let vote = HotstuffMessage::new(MessageType::Vote, view, None, None);
        let proposal = HotstuffMessage::new(MessageType::Propose, view, None, None);
        assert_ne!(
            vote.signing_hash().unwrap(),
            proposal.signing_hash().unwrap()
        );
        assert_eq!(
            vote.signing_hash().unwrap(),
            VoteDigest::new(view, Hash::ZERO).hash().unwrap()
        );
    }

    #[test]
    fn test_threshold_signature_sorted_and_deduplicated() {
        let sig = |byte: u8| PartialSignature {
            signer_address: Address::new([byte; 20]),
            signature: Sig::default(),
        };
        let threshold = ThresholdSignature::from_signatures(vec![sig(3), sig(1), sig(3), sig(2)]);
        let signers: Vec<u8> = threshold.signers().map(|a| a.as_bytes()[0]).collect();
        assert_eq!(signers, vec![1, 2, 3]);
    }

    #[test]
    fn test_qc_newer_than() {
        let qc = |height, round| {
            QuorumCertificate::new(
                View::new(height, round, Step::Prepare),
                Hash::ZERO,
                ThresholdSignature::default(),
            )
        };
        assert!(qc(1, 2).is_newer_than(&qc(1, 1)));
        assert!(qc(2, 0).is_newer_than(&qc(1, 9)));
        assert!(!qc(1, 1).is_newer_than(&qc(1, 1)));
    }
}
