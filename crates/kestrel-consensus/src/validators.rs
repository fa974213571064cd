use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_core::ValidatorSet;

use crate::error::ConsensusError;

/// Read-only access to the validator roster in force at a height.
///
/// Implementations must return the same ordering for repeated calls at the
/// same height.
pub trait ValidatorSetView: Send + Sync {
    fn get_validators(&self, height: u64) -> Result<Arc<ValidatorSet>, ConsensusError>;
}

/// Validator sets keyed by the height they take effect at
#[derive(Debug, Clone, Default)]
pub struct ValidatorSchedule {
    sets: BTreeMap<u64, Arc<ValidatorSet>>,
}

impl ValidatorSchedule {
    /// A schedule with one set in force from `from_height` onwards
    pub fn new(from_height: u64, set: ValidatorSet) -> Self {
        let mut schedule = ValidatorSchedule::default();
        schedule.insert(from_height, set);
        schedule
    }

    pub fn insert(&mut self, from_height: u64, set: ValidatorSet) {
        self.sets.insert(from_height, Arc::new(set));
    }
}

impl ValidatorSetView for ValidatorSchedule {
    fn get_validators(&self, height: u64) -> Result<Arc<ValidatorSet>, ConsensusError> {
        self.sets
            .range(..=height)
            .next_back()
            .map(|(_, set)| Arc::clone(set))
            .filter(|set| !set.is_empty())
            .ok_or(ConsensusError::ValidatorSetUnavailable(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::KeyPair;

    fn set_of(seeds: &[u8]) -> ValidatorSet {
        let keys: Vec<_> = seeds.iter().map(|s| KeyPair::from_seed_index(*s).public).collect();
        ValidatorSet::from_public_keys(&keys)
    }

    #[test]
    fn test_schedule_resolves_latest_set() {
        let mut schedule = ValidatorSchedule::new(1, set_of(&[1, 2, 3, 4]));
        schedule.insert(10, set_of(&[1, 2, 3]));

        assert_eq!(schedule.get_validators(1).unwrap().len(), 4);
        assert_eq!(schedule.get_validators(9).unwrap().len(), 4);
        assert_eq!(schedule.get_validators(10).unwrap().len(), 3);
        assert_eq!(schedule.get_validators(500).unwrap().len(), 3);
    }

    #[test]
    fn test_schedule_unavailable_height() {
        let schedule = ValidatorSchedule::new(5, set_of(&[1]));
        assert!(matches!(
            schedule.get_validators(4),
            Err(ConsensusError::ValidatorSetUnavailable(4))
        ));
    }

    #[test]
    fn test_empty_set_is_unavailable() {
        let schedule = ValidatorSchedule::new(0, ValidatorSet::default());
        assert!(schedule.get_validators(0).is_err());
    }
}
