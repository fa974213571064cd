use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::hash::hash_blake3;
use crate::crypto::keys::PublicKey;
use crate::error::CoreError;

pub const ADDRESS_LEN: usize = 20;

/// Validator address: the first 20 bytes of the Blake3 hash of the public key.
///
/// Addresses order validator sets, so the derived `Ord` is part of the
/// consensus rules.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Address(bytes)
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = hash_blake3(public_key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..ADDRESS_LEN]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)?;
        let len = bytes.len();
        let array: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidAddress(len))?;
        Ok(Address(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;

    #[test]
    fn test_address_derivation_is_stable() {
        let kp = KeyPair::from_seed_index(1);
        assert_eq!(Address::from_public_key(&kp.public), kp.public.address());
    }

    #[test]
    fn test_address_hex() {
        let address = KeyPair::from_seed_index(2).address();
        assert_eq!(Address::from_hex(&address.to_hex()).unwrap(), address);
        assert!(matches!(
            Address::from_hex("0011"),
            Err(CoreError::InvalidAddress(2))
        ));
    }
}
