use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{Address, PublicKey};

/// A staked validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub public_key: PublicKey,
    pub voting_power: u64,
}

impl Validator {
    pub fn new(public_key: PublicKey, voting_power: u64) -> Self {
        Validator {
            address: public_key.address(),
            public_key,
            voting_power,
        }
    }
}

/// Validator roster for one height, ordered by address.
///
/// The ordering is identical on every node, which is what makes leader
/// election deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Validator>", into = "Vec<Validator>")]
pub struct ValidatorSet {
    validators: BTreeMap<Address, Validator>,
}

impl ValidatorSet {
    pub fn new(validators: impl IntoIterator<Item = Validator>) -> Self {
        ValidatorSet {
            validators: validators
                .into_iter()
                .map(|validator| (validator.address, validator))
                .collect(),
        }
    }

    /// Equal-power set built from public keys
    pub fn from_public_keys(keys: &[PublicKey]) -> Self {
        Self::new(keys.iter().map(|key| Validator::new(*key, 1)))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.validators.contains_key(address)
    }

    /// Validators in address order
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.validators.keys()
    }

    /// Validator at `index` in address order
    pub fn by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.values().nth(index)
    }

    /// Position of `address` in address order
    pub fn position(&self, address: &Address) -> Option<usize> {
        self.validators.keys().position(|candidate| candidate == address)
    }

    pub fn total_voting_power(&self) -> u64 {
        self.validators.values().map(|v| v.voting_power).sum()
    }
}

impl From<Vec<Validator>> for ValidatorSet {
    fn from(validators: Vec<Validator>) -> Self {
        ValidatorSet::new(validators)
    }
}

impl From<ValidatorSet> for Vec<Validator> {
    fn from(set: ValidatorSet) -> Self {
        set.validators.into_values().collect()
    }
}
