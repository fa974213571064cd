use kestrel_core::{Address, ValidatorSet, View};

/// Maps a view to the validator authorised to propose in it.
///
/// Must be a pure function of public information so every honest node
/// elects the same leader.
pub trait LeaderElector: Send + Sync {
    /// `None` only when the validator set is empty
    fn leader_for_view(&self, validators: &ValidatorSet, view: View) -> Option<Address>;
}

/// Round-robin over validators in address order: index `(height + round) mod N`.
///
/// The step does not influence the choice, so one leader owns the whole
/// (height, round).
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinElector;

impl LeaderElector for RoundRobinElector {
    fn leader_for_view(&self, validators: &ValidatorSet, view: View) -> Option<Address> {
        if validators.is_empty() {
            return None;
        }
        let n = validators.len() as u64;
        let index = (view.height % n + view.round % n) % n;
        validators.by_index(index as usize).map(|v| v.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{KeyPair, Step};

    fn validator_set(n: u8) -> ValidatorSet {
        let keys: Vec<_> = (1..=n).map(|i| KeyPair::from_seed_index(i).public).collect();
        ValidatorSet::from_public_keys(&keys)
    }

    #[test]
    fn test_round_robin_index() {
        let set = validator_set(4);
        let elector = RoundRobinElector;
        let address_at = |i: usize| set.by_index(i).unwrap().address;

        assert_eq!(
            elector.leader_for_view(&set, View::new(1, 0, Step::NewRound)),
            Some(address_at(1))
        );
        assert_eq!(
            elector.leader_for_view(&set, View::new(3, 6, Step::Prepare)),
            Some(address_at(1))
        );
        assert_eq!(
            elector.leader_for_view(&set, View::new(2, 1, Step::Commit)),
            Some(address_at(3))
        );
    }

    #[test]
    fn test_step_does_not_change_leader() {
        let set = validator_set(5);
        let elector = RoundRobinElector;
        let leaders: Vec<_> = Step::ALL
            .iter()
            .map(|step| elector.leader_for_view(&set, View::new(7, 2, *step)))
            .collect();
        assert!(leaders.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_identical_across_independently_built_sets() {
        let elector = RoundRobinElector;
        let mut reversed: Vec<_> = (1..=7).map(|i| KeyPair::from_seed_index(i).public).collect();
        reversed.reverse();
        let a = validator_set(7);
        let b = ValidatorSet::from_public_keys(&reversed);

        for height in 0..20 {
            for round in 0..5 {
                let view = View::new(height, round, Step::NewRound);
                assert_eq!(
                    elector.leader_for_view(&a, view),
                    elector.leader_for_view(&b, view)
                );
            }
        }
    }

    #[test]
    fn test_extreme_view_does_not_overflow() {
        let set = validator_set(3);
        let view = View::new(u64::MAX, u64::MAX, Step::NewRound);
        assert!(RoundRobinElector.leader_for_view(&set, view).is_some());
    }

    #[test]
    fn test_empty_set_has_no_leader() {
        let view = View::new(1, 0, Step::NewRound);
        assert!(RoundRobinElector
            .leader_for_view(&ValidatorSet::default(), view)
            .is_none());
    }
}
