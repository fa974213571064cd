use ed25519_dalek::{Signature as DalekSignature, Signer};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::fmt;

use crate::crypto::keys::{PublicKey, SecretKey};
use crate::error::CoreError;

/// Ed25519 signature over a vote or proposal digest.
///
/// The all-zero value is a placeholder carried by unsigned messages and
/// never verifies.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sig(#[serde(with = "BigArray")] pub [u8; 64]);

impl Sig {
    pub const ZERO: Sig = Sig([0u8; 64]);

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for Sig {
    fn default() -> Self {
        Sig::ZERO
    }
}

impl TryFrom<&[u8]> for Sig {
    type Error = CoreError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        bytes
            .try_into()
            .map(Sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}..)", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Sig {
    Sig(secret_key.signing_key().sign(message).to_bytes())
}

/// Strict verification: rejects small-order keys and malleable encodings,
/// so one vote has exactly one valid signature.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Sig) -> Result<(), CoreError> {
    if signature.is_zero() {
        return Err(CoreError::InvalidSignature);
    }
    public_key
        .to_verifying_key()?
        .verify_strict(message, &DalekSignature::from_bytes(&signature.0))
        .map_err(|_| CoreError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::hash_blake3;
    use crate::crypto::keys::KeyPair;

    #[test]
    fn test_vote_digest_signature() {
        let kp = KeyPair::from_seed_index(1);
        let digest = hash_blake3(b"vote 1/0/Prepare");
        let sig = sign(&kp.secret, digest.as_bytes());
        assert!(verify(&kp.public, digest.as_bytes(), &sig).is_ok());

        let other = hash_blake3(b"vote 1/1/Prepare");
        assert!(verify(&kp.public, other.as_bytes(), &sig).is_err());
    }

    #[test]
    fn test_signature_from_other_validator() {
        let signer = KeyPair::from_seed_index(1);
        let claimed = KeyPair::from_seed_index(2);
        let sig = sign(&signer.secret, b"digest");
        assert!(matches!(
            verify(&claimed.public, b"digest", &sig),
            Err(CoreError::InvalidSignature)
        ));
    }

    #[test]
    fn test_placeholder_never_verifies() {
        let kp = KeyPair::generate();
        assert!(Sig::default().is_zero());
        assert!(verify(&kp.public, b"digest", &Sig::ZERO).is_err());
        assert!(Sig::try_from(&[1u8; 63][..]).is_err());
    }
}
