use proptest::prelude::*;
use std::sync::Arc;
use trustmesh_consensus::{
    clamp_weight, fault_tolerance, quorum_size, ConsensusConfig, ConsensusEngine, ConsensusMessage,
    ConsensusPayload, Membership, Phase, ReputationAggregator, ReputationConfig, VoteTally,
};
use trustmesh_crypto::NodeIdentity;
use trustmesh_network::{ConnectionStatus, PeerDirectory, PeerRecord};
use trustmesh_types::{MetricField, PeerId, StateMetrics, StateSubmission};

const NOW: u64 = 1_700_000_000_000;

fn peer(seed: u8) -> PeerId {
    PeerId::from_public_key(&[seed; 32])
}

/// `n` deterministic identities sorted by id, so member 0 leads view 0.
fn members(n: usize) -> Vec<Arc<NodeIdentity>> {
    let mut all: Vec<Arc<NodeIdentity>> = (1..=n as u8)
        .map(|seed| Arc::new(NodeIdentity::from_secret_bytes(&[seed; 32], &[seed; 32])))
        .collect();
    all.sort_by_key(|identity| identity.peer_id());
    all
}

fn engine_for(local: &Arc<NodeIdentity>, all: &[Arc<NodeIdentity>]) -> ConsensusEngine {
    let record = |identity: &NodeIdentity| {
        let keys = identity.public_keys();
        PeerRecord::new("127.0.0.1", 7000, keys.signing, keys.agreement, NOW)
    };
    let directory = Arc::new(PeerDirectory::new(record(local)));
    for identity in all {
        if identity.peer_id() != local.peer_id() {
            directory.add(record(identity)).expect("add peer");
            directory.set_status(&identity.peer_id(), ConnectionStatus::Connected);
        }
    }
    ConsensusEngine::new(local.clone(), directory, ConsensusConfig::default())
}

fn vote(identity: &NodeIdentity, payload: ConsensusPayload, digest: [u8; 32]) -> ConsensusMessage {
    ConsensusMessage::signed(identity, payload, 0, 1, digest)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A follower holding the proposal moves on only with 2f + 1 matching
    /// votes, counting its own, in each phase.
    #[test]
    fn test_two_f_matching_votes_never_advance_a_phase(n in 1usize..=50) {
        let all = members(n);
        let mut leader = engine_for(&all[0], &all);
        let proposal = leader.begin_round(NOW);
        let f = fault_tolerance(n);
        if n == 1 {
            prop_assert_eq!(leader.take_finalized().len(), 1);
            return Ok(());
        }

        let mut follower = engine_for(&all[1], &all);
        follower.begin_round(NOW);
        follower.handle_message(proposal[0].clone(), NOW);
        if f == 0 {
            prop_assert_eq!(follower.phase(), Phase::Finalized);
            return Ok(());
        }
        prop_assert_eq!(follower.phase(), Phase::Prepare);

        let digest = proposal[0].digest;
        let others: Vec<&Arc<NodeIdentity>> = all.iter().filter(|identity| identity.peer_id() != all[1].peer_id()).collect();
        let (matching, rest) = others.split_at(2 * f);
        let conflicting = &rest[..f];

        for payload in [ConsensusPayload::Prepare, ConsensusPayload::Commit] {
            for voter in &matching[..2 * f - 1] {
                follower.handle_message(vote(voter, payload.clone(), digest), NOW);
            }
            for voter in conflicting {
                follower.handle_message(vote(voter, payload.clone(), [0xEE; 32]), NOW);
            }
            let before = follower.phase();
            prop_assert!(follower.take_finalized().is_empty());
            follower.handle_message(vote(matching[2 * f - 1], payload.clone(), digest), NOW);
            if payload == ConsensusPayload::Prepare {
                prop_assert_eq!(before, Phase::Prepare);
                prop_assert_eq!(follower.phase(), Phase::Commit);
            } else {
                prop_assert_eq!(before, Phase::Commit);
                prop_assert_eq!(follower.phase(), Phase::Finalized);
                prop_assert_eq!(follower.take_finalized().len(), 1);
            }
        }
    }
}

proptest! {
    #[test]
    fn test_quorum_tolerates_f_faults(n in 1usize..=50) {
        let f = fault_tolerance(n);
        let q = quorum_size(n);

        prop_assert_eq!(f, (n - 1) / 3);
        prop_assert_eq!(q, 2 * f + 1);
        prop_assert!(q <= n);
        prop_assert!(3 * f + 1 <= n);
        // The honest members alone can always form a quorum.
        prop_assert!(n - f >= q);
    }

    #[test]
    fn test_two_quorums_overlap_in_an_honest_member(f in 0usize..=16) {
        let n = 3 * f + 1;
        let q = quorum_size(n);
        prop_assert!(2 * q - n > f);
    }

    #[test]
    fn test_leader_rotates_through_every_member(
        seeds in proptest::collection::btree_set(any::<u8>(), 1..12),
        offset in 0u64..1_000,
    ) {
        let members = Membership::new(seeds.iter().map(|seed| peer(*seed)).collect());
        let n = members.len() as u64;
        let mut leaders: Vec<PeerId> = (offset..offset + n)
            .map(|view| members.leader(view).expect("leader"))
            .collect();
        leaders.sort();
        prop_assert_eq!(leaders.as_slice(), members.members());
    }

    #[test]
    fn test_tally_counts_each_voter_once(votes in proptest::collection::vec((0u8..8, 0u8..3), 0..64)) {
        let mut tally = VoteTally::default();
        let mut first = std::collections::HashMap::new();
        for (voter, digest) in &votes {
            let fresh = tally.record(peer(*voter), [*digest; 32]);
            prop_assert_eq!(fresh, !first.contains_key(voter));
            first.entry(*voter).or_insert(*digest);
        }
        prop_assert_eq!(tally.len(), first.len());
        for digest in 0u8..3 {
            let expected = first.values().filter(|vote| **vote == digest).count();
            prop_assert_eq!(tally.count(&[digest; 32]), expected);
        }
    }

    #[test]
    fn test_clamped_weights_stay_in_unit_range(weight in any::<f64>()) {
        let clamped = clamp_weight(weight);
        prop_assert!((0.0..=1.0).contains(&clamped));
    }

    #[test]
    fn test_weighted_mean_stays_within_submitted_values(
        reports in proptest::collection::vec((0.0f64..=1.0, -1.0f64..=1.0), 1..20),
    ) {
        let mut aggregator = ReputationAggregator::new(ReputationConfig::default());
        let states: Vec<StateSubmission> = reports
            .iter()
            .enumerate()
            .map(|(index, (weight, valence))| {
                let node = peer(index as u8);
                aggregator.update_weight(node, *weight).expect("weight");
                StateSubmission::unsigned(
                    node,
                    1_000,
                    StateMetrics { valence: *valence, ..StateMetrics::default() },
                )
            })
            .collect();

        let mean = aggregator.compute_metric(MetricField::Valence, &states);
        let total: f64 = reports.iter().map(|(weight, _)| *weight).sum();
        if total == 0.0 {
            prop_assert_eq!(mean, 0.0);
        } else {
            let low = reports.iter().map(|(_, value)| *value).fold(f64::INFINITY, f64::min);
            let high = reports.iter().map(|(_, value)| *value).fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(mean >= low - 1e-9 && mean <= high + 1e-9, "mean {} outside [{}, {}]", mean, low, high);
        }
    }
}
