//! Nodes that drifted apart rejoin through catch up and block sync

use kestrel_consensus::testing::{Captured, TestNetwork};
use kestrel_consensus::{ConsensusConfig, ConsensusMessage, DebugCommand, PacemakerConfig, StateSyncMessage};
use kestrel_core::{
    hash_blake3, merkle_root, sign, tx_hash, Block, BlockHeader, Hash, HotstuffMessage, KeyPair,
    MessageType, PartialSignature, Step, View,
};

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

fn signed_proposal(leader: &KeyPair, view: View) -> HotstuffMessage {
    let txs = vec![b"catch-up".to_vec()];
    let hashes: Vec<Hash> = txs.iter().map(|tx| tx_hash(tx)).collect();
    let block = Block::new(
        BlockHeader {
            height: view.height,
            proposer_address: leader.address(),
            prev_state_hash: Hash::ZERO,
            state_hash: hash_blake3(b"catch-up"),
            num_txs: 1,
            tx_root: merkle_root(&hashes),
        },
        txs,
    );
    let mut msg = HotstuffMessage::new(MessageType::Propose, view, Some(block), None);
    let digest = msg.signing_hash().unwrap();
    msg.signature = Some(PartialSignature {
        signer_address: leader.address(),
        signature: sign(&leader.secret, digest.as_bytes()),
    });
    msg
}

#[tokio::test]
async fn test_replicas_catch_up_to_leader_round() {
    let network = TestNetwork::new(4, manual_config(), 1).unwrap();
    network.debug_all(DebugCommand::SetHeight(3)).await.unwrap();
    network.debug_all(DebugCommand::SetStep(Step::NewRound)).await.unwrap();

    // Leader of (3, 6) is index (3 + 6) mod 4 = 1
    let rounds = [4u64, 6, 3, 2];
    for (node, round) in network.nodes.iter().zip(rounds) {
        node.handle.debug(DebugCommand::SetRound(round)).await.unwrap();
    }
    network.settle().await.unwrap();

    let leader = &network.nodes[1];
    let proposal = signed_proposal(&leader.keypair, View::new(3, 6, Step::Prepare));
    network
        .deliver_all(&[Captured {
            from: leader.address(),
            to: None,
            message: proposal.into(),
        }])
        .await
        .unwrap();

    let states = network.states().await.unwrap();
    for (i, state) in states.iter().enumerate() {
        assert_eq!(state.leader_id, Some(leader.address()));
        if i == 1 {
            assert_eq!((state.height, state.round, state.step), (3, 6, Step::Prepare));
            assert!(state.is_leader);
        } else {
            assert_eq!((state.height, state.round, state.step), (3, 6, Step::PreCommit));
            assert!(!state.is_leader);
        }
    }

    let votes: Vec<_> = network.take_captured();
    assert_eq!(votes.len(), 3);
    for vote in &votes {
        assert_eq!(vote.to, Some(leader.address()));
        assert!(matches!(&vote.message,
            ConsensusMessage::Hotstuff(m) if m.msg_type == MessageType::Vote && m.step == Step::Prepare && m.round == 6));
    }

    network.shutdown().await;
}

#[tokio::test]
async fn test_lagging_node_syncs_missed_block() {
    let network = TestNetwork::new(4, manual_config(), 1).unwrap();
    let lagging = 3;
    let others = || (0..network.nodes.len()).filter(|i| *i != lagging);

    for i in others() {
        network.nodes[i].handle.trigger_next_view().await.unwrap();
    }
    network.settle().await.unwrap();
    for _ in 0..64 {
        let batch = network.take_captured();
        if batch.is_empty() {
            break;
        }
        for captured in &batch {
            for i in others() {
                network.deliver_to(i, captured).await.unwrap();
            }
        }
        network.settle().await.unwrap();
    }
    assert_eq!(network.nodes[lagging].handle.node_state().await.unwrap().height, 1);

    // A height-2 vote tells the lagging node it fell behind
    network.nodes[0].handle.trigger_next_view().await.unwrap();
    network.settle().await.unwrap();
    for captured in network.take_captured() {
        network.deliver_to(lagging, &captured).await.unwrap();
    }
    network.settle().await.unwrap();

    let requests = network.take_captured();
    assert_eq!(requests.len(), 1);
    assert!(matches!(&requests[0].message,
        ConsensusMessage::StateSync(StateSyncMessage::BlockRequest { height: 1, .. })));
    for i in others() {
        network.deliver_to(i, &requests[0]).await.unwrap();
    }
    network.settle().await.unwrap();

    let responses = network.take_captured();
    assert_eq!(responses.len(), 3);
    network.deliver_all(&responses).await.unwrap();

    let state = network.nodes[lagging].handle.node_state().await.unwrap();
    assert_eq!((state.height, state.step), (2, Step::NewRound));
    assert_eq!(
        network.nodes[lagging].ledger.committed_hash(1),
        network.nodes[0].ledger.committed_hash(1)
    );

    network.shutdown().await;
}
