//! Round interruption and recovery with the pacemaker in manual mode

use kestrel_consensus::testing::TestNetwork;
use kestrel_consensus::{ConsensusConfig, ConsensusMessage, PacemakerConfig};
use kestrel_core::{MessageType, Step};

fn manual_config() -> ConsensusConfig {
    ConsensusConfig {
        pacemaker: PacemakerConfig {
            manual_mode: true,
            inter_step_delay_ms: 0,
            ..PacemakerConfig::default()
        },
        ..ConsensusConfig::default()
    }
}

#[tokio::test]
async fn test_forced_timeouts_then_recovery() {
    let network = TestNetwork::new(4, manual_config(), 1).unwrap();

    network.trigger_next_view_all().await.unwrap();
    for expected_round in 1..=3u64 {
        // Nothing is delivered: every round stalls
        network.force_timeout_all().await.unwrap();
        let states = network.states().await.unwrap();
        for state in &states {
            assert_eq!((state.height, state.round, state.step), (1, expected_round, Step::NewRound));
        }
    }

    let round_three: Vec<_> = network
        .take_captured()
        .into_iter()
        .filter(|c| match &c.message {
            ConsensusMessage::Hotstuff(m) => m.msg_type == MessageType::Vote && m.round == 3,
            ConsensusMessage::StateSync(_) => false,
        })
        .collect();
    assert_eq!(round_three.len(), 4);
    network.deliver_all(&round_three).await.unwrap();

    // (1 + 3) mod 4
    let leader = network.nodes[0].address();
    let states = network.states().await.unwrap();
    for state in &states {
        assert_eq!((state.height, state.round, state.step), (1, 3, Step::Prepare));
        assert_eq!(state.leader_id, Some(leader));
    }
    assert!(states[0].is_leader);

    let proposals: Vec<_> = network
        .take_captured()
        .into_iter()
        .filter(|c| matches!(&c.message,
            ConsensusMessage::Hotstuff(m) if m.msg_type == MessageType::Propose && m.step == Step::Prepare))
        .collect();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].from, leader);

    network.shutdown().await;
}

#[tokio::test]
async fn test_manual_mode_waits_for_trigger() {
    let network = TestNetwork::new(4, manual_config(), 1).unwrap();
    network.settle().await.unwrap();
    assert!(network.take_captured().is_empty());

    let states = network.states().await.unwrap();
    assert!(states.iter().all(|s| s.round == 0 && s.step == Step::NewRound));

    network.shutdown().await;
}

#[tokio::test]
async fn test_round_timer_interrupts_stalled_round() {
    let config = ConsensusConfig {
        pacemaker: PacemakerConfig {
            timeout_ms: 50,
            max_timeout_ms: 400,
            manual_mode: false,
            inter_step_delay_ms: 0,
        },
        ..ConsensusConfig::default()
    };
    let network = TestNetwork::new(4, config, 1).unwrap();

    // Undelivered traffic: the first round can only end by timer
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let states = network.states().await.unwrap();
    for state in &states {
        assert_eq!(state.height, 1);
        assert!(state.round >= 1);
    }

    let new_round_votes = network
        .take_captured()
        .iter()
        .filter(|c| matches!(&c.message,
            ConsensusMessage::Hotstuff(m) if m.step == Step::NewRound && m.round >= 1))
        .count();
    assert!(new_round_votes >= 4);

    network.shutdown().await;
}

#[tokio::test]
async fn test_caught_up_node_casts_own_new_round_vote() {
    // Timers are armed but far longer than the test
    let config = ConsensusConfig {
        pacemaker: PacemakerConfig {
            manual_mode: false,
            ..PacemakerConfig::default()
        },
        ..ConsensusConfig::default()
    };
    let network = TestNetwork::new(4, config, 1).unwrap();
    network.settle().await.unwrap();
    // Round 0 votes are never delivered
    assert_eq!(network.take_captured().len(), 4);

    network.nodes[0].handle.force_timeout().await.unwrap();
    network.settle().await.unwrap();
    let round_one = network.take_captured();
    assert_eq!(round_one.len(), 1);

    network.deliver_to(1, &round_one[0]).await.unwrap();
    network.settle().await.unwrap();

    let states = network.states().await.unwrap();
    assert_eq!((states[1].height, states[1].round, states[1].step), (1, 1, Step::NewRound));

    let follower = network.nodes[1].address();
    let own_votes: Vec<_> = network
        .take_captured()
        .into_iter()
        .filter(|c| c.from == follower)
        .filter(|c| matches!(&c.message,
            ConsensusMessage::Hotstuff(m)
                if m.msg_type == MessageType::Vote && m.step == Step::NewRound && m.round == 1))
        .collect();
    assert_eq!(own_votes.len(), 1);
    assert!(own_votes[0].to.is_none());

    network.shutdown().await;
}
