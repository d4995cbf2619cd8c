use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use trustmesh_consensus::{
    register_inbox, ConsensusConfig, ConsensusEngine, ReputationAggregator, ReputationConfig,
    RoundDriver, RoundOutcome, RoundSummary, StateSource, TracingSink,
};
use trustmesh_crypto::NodeIdentity;
use trustmesh_network::{MemoryHub, PeerDirectory, PeerRecord, Transport, TransportConfig};
use trustmesh_types::{now_millis, StateMetrics};

struct FixedSource(f64);

impl StateSource for FixedSource {
    fn current_metrics(&self) -> anyhow::Result<Option<StateMetrics>> {
        Ok(Some(StateMetrics {
            coherence: self.0,
            ..StateMetrics::default()
        }))
    }
}

struct ClusterNode {
    transport: Transport,
    record: PeerRecord,
    outcomes: mpsc::UnboundedReceiver<RoundOutcome>,
}

fn transport_config() -> TransportConfig {
    TransportConfig {
        connect_timeout_ms: 200,
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        min_broadcast_reputation: 0.0,
        ..TransportConfig::default()
    }
}

async fn first_summary(node: &mut ClusterNode) -> RoundSummary {
    let outcome = tokio::time::timeout(Duration::from_secs(10), node.outcomes.recv())
        .await
        .expect("round finished in time")
        .expect("driver running");
    match outcome {
        RoundOutcome::Finalized(summary) => summary,
        RoundOutcome::Unavailable(err) => panic!("round failed: {err}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_four_drivers_agree_over_memory_links() {
    let hub = MemoryHub::new();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let consensus = ConsensusConfig {
        round_interval_ms: 200,
        round_timeout_ms: 10_000,
        ..ConsensusConfig::default()
    };

    let mut nodes = Vec::new();
    let mut pending_drivers = Vec::new();
    for seed in 1..=4u8 {
        let identity = Arc::new(NodeIdentity::from_secret_bytes(&[seed; 32], &[seed; 32]));
        let keys = identity.public_keys();
        let record = PeerRecord::new("memory", seed as u16, keys.signing, keys.agreement, now_millis());
        let directory = Arc::new(PeerDirectory::new(record.clone()));
        let transport = Transport::new(identity.clone(), directory.clone(), hub.link(), transport_config());
        hub.attach(transport.clone());

        let (inbox_tx, inbox) = mpsc::channel(1024);
        register_inbox(&transport, inbox_tx);
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let driver = RoundDriver::new(
            ConsensusEngine::new(identity, directory, consensus.clone()),
            ReputationAggregator::new(ReputationConfig::default()),
            Box::new(TracingSink),
            Arc::new(transport.clone()),
            Some(Arc::new(FixedSource(0.25 * seed as f64))),
            outcomes_tx,
        );
        pending_drivers.push((driver, inbox));
        nodes.push(ClusterNode {
            transport,
            record,
            outcomes,
        });
    }

    for a in 0..nodes.len() {
        for b in 0..nodes.len() {
            if a != b {
                assert!(nodes[a].transport.connect(&nodes[b].record).await);
            }
        }
    }
    for node in &nodes {
        assert_eq!(node.transport.directory().live_count(), 4);
    }

    let tasks: Vec<_> = pending_drivers
        .into_iter()
        .map(|(driver, inbox)| tokio::spawn(driver.run(inbox, shutdown.clone())))
        .collect();

    let mut summaries = Vec::new();
    for node in nodes.iter_mut() {
        summaries.push(first_summary(node).await);
    }
    let first = &summaries[0];
    assert_eq!(first.sequence, 1);
    for summary in &summaries {
        assert_eq!(summary.sequence, first.sequence);
        assert_eq!(summary.view, first.view);
        assert_eq!(summary.digest, first.digest);
        assert_eq!(summary.summary, first.summary);
    }

    shutdown_tx.send(true).expect("signal");
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver stops")
            .expect("join");
    }
    for node in &nodes {
        node.transport.shutdown();
    }
}
