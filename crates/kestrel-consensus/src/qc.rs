use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_core::{
    Address, Hash, PartialSignature, QuorumCertificate, ThresholdSignature, ValidatorSet, View,
    VoteDigest,
};
use tracing::debug;

use crate::error::ConsensusError;
use crate::interfaces::Verifier;

/// Byzantine-safe quorum: strictly more than two thirds of the validators.
///
/// Integer form of `count > 2N/3`, i.e. `count >= floor(2N/3) + 1`.
pub fn is_byzantine_threshold_met(count: usize, validator_count: usize) -> bool {
    validator_count > 0 && 3 * count > 2 * validator_count
}

/// Minimum number of signatures forming a quorum
pub fn quorum_threshold(validator_count: usize) -> usize {
    2 * validator_count / 3 + 1
}

/// Result of offering one partial signature to an accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    Duplicate,
    Invalid,
}

/// Collects partial signatures for one (view, block) and builds the QC.
///
/// Scoped to a single view; a new accumulator is created for every view.
pub struct QcAccumulator {
    view: View,
    block_hash: Hash,
    digest: Hash,
    validators: Arc<ValidatorSet>,
    signatures: BTreeMap<Address, PartialSignature>,
}

impl QcAccumulator {
    pub fn new(
        view: View,
        block_hash: Hash,
        validators: Arc<ValidatorSet>,
    ) -> Result<Self, ConsensusError> {
        let digest = VoteDigest::new(view, block_hash).hash()?;
        Ok(QcAccumulator {
            view,
            block_hash,
            digest,
            validators,
            signatures: BTreeMap::new(),
        })
    }

    /// Offer a partial signature.
    ///
    /// Signers outside the validator set and bad signatures are `Invalid`; a
    /// second submission from an accepted signer is `Duplicate` and leaves the
    /// accumulator unchanged.
    pub fn add_partial_signature(&mut self, signature: PartialSignature) -> AddOutcome {
        if self.signatures.contains_key(&signature.signer_address) {
            debug!(signer = %signature.signer_address, view = %self.view, "Duplicate partial signature");
            return AddOutcome::Duplicate;
        }

        if !self.validators.verify(
            &signature.signer_address,
            self.digest.as_bytes(),
            &signature.signature,
        ) {
            return AddOutcome::Invalid;
        }

        self.signatures
            .insert(signature.signer_address, signature);

        debug!(
            view = %self.view,
            have = self.signatures.len(),
            need = self.threshold(),
            "Added partial signature"
        );

        AddOutcome::Accepted
    }

    pub fn has_quorum(&self) -> bool {
        is_byzantine_threshold_met(self.signatures.len(), self.validators.len())
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn threshold(&self) -> usize {
        quorum_threshold(self.validators.len())
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn block_hash(&self) -> Hash {
        self.block_hash
    }

    /// Assemble the QC; signatures are ordered by signer address
    pub fn build(&self) -> Result<QuorumCertificate, ConsensusError> {
        if !self.has_quorum() {
            return Err(ConsensusError::InsufficientSignatures {
                have: self.signatures.len(),
                need: self.threshold(),
            });
        }

        Ok(QuorumCertificate::new(
            self.view,
            self.block_hash,
            ThresholdSignature {
                signatures: self.signatures.values().cloned().collect(),
            },
        ))
    }
}

/// Re-verify a QC against the validator set in force at its height
pub fn validate_quorum_certificate(
    qc: &QuorumCertificate,
    validators: &ValidatorSet,
) -> Result<(), ConsensusError> {
    let signatures = &qc.threshold_signature.signatures;

    if signatures
        .windows(2)
        .any(|pair| pair[0].signer_address >= pair[1].signer_address)
    {
        return Err(ConsensusError::InvalidQuorumCertificate(
            "signers not strictly ordered".to_string(),
        ));
    }

    let digest = qc.digest().hash()?;
    for partial in signatures {
        if !validators.contains(&partial.signer_address) {
            return Err(ConsensusError::UnknownValidator(partial.signer_address));
        }
        if !validators.verify(&partial.signer_address, digest.as_bytes(), &partial.signature) {
            return Err(ConsensusError::InvalidPartialSignature(
                partial.signer_address,
            ));
        }
    }

    if !is_byzantine_threshold_met(signatures.len(), validators.len()) {
        return Err(ConsensusError::InsufficientSignatures {
            have: signatures.len(),
            need: quorum_threshold(validators.len()),
        });
    }

    Ok(())
}
