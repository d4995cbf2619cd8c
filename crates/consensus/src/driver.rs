//! Async owner of the consensus engine.
//!
//! Network handlers only enqueue decoded inputs; the driver drains them on
//! its own task so that no phase transition ever interleaves with another.
//! It also starts rounds on a fixed interval, fires the round timer and
//! hands finalized batches to the reputation aggregator and summary sink.

use crate::engine::ConsensusEngine;
use crate::errors::ConsensusError;
use crate::messages::ConsensusMessage;
use crate::reputation::ReputationAggregator;
use crate::sink::{RoundSummary, SummarySink};
use anyhow::{anyhow, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};
use trustmesh_network::{SendOutcome, Transport};
use trustmesh_types::{now_millis, MessageType, NetworkMessage, Recipient, StateMetrics, StateSubmission};

/// Supplies the local node's metrics each round.
pub trait StateSource: Send + Sync {
    /// `Ok(None)` skips this round's submission.
    fn current_metrics(&self) -> anyhow::Result<Option<StateMetrics>>;
}

/// Outbound side of the consensus protocol.
pub trait ConsensusBus: Send + Sync {
    fn broadcast_consensus(&self, message: &ConsensusMessage);
    fn broadcast_state(&self, state: &StateSubmission);
}

impl ConsensusBus for Transport {
    fn broadcast_consensus(&self, message: &ConsensusMessage) {
        match message.encode() {
            Ok(payload) => log_outcome(
                "consensus",
                self.publish(MessageType::Consensus, Recipient::Broadcast, payload),
            ),
            Err(err) => warn!(error = %err, "failed to encode consensus message"),
        }
    }

    fn broadcast_state(&self, state: &StateSubmission) {
        match bincode::serialize(state) {
            Ok(payload) => log_outcome(
                "state",
                self.publish(MessageType::StateSubmission, Recipient::Broadcast, payload),
            ),
            Err(err) => warn!(error = %err, "failed to encode state submission"),
        }
    }
}

fn log_outcome(kind: &str, outcome: SendOutcome) {
    match outcome {
        SendOutcome::Queued { peers } => debug!(kind, peers, "broadcast queued"),
        SendOutcome::Dropped(reason) => debug!(kind, ?reason, "broadcast dropped"),
    }
}

#[derive(Debug, Clone)]
pub enum ConsensusInput {
    Message(ConsensusMessage),
    State(StateSubmission),
}

#[derive(Debug, Clone)]
pub enum RoundOutcome {
    Finalized(RoundSummary),
    Unavailable(ConsensusError),
}

/// Route consensus and state envelopes from `transport` into `inbox`.
pub fn register_inbox(transport: &Transport, inbox: mpsc::Sender<ConsensusInput>) {
    let consensus_inbox = inbox.clone();
    transport.register_handler(
        MessageType::Consensus,
        Arc::new(move |envelope: NetworkMessage| -> anyhow::Result<()> {
            let message = ConsensusMessage::decode(&envelope.payload)?;
            if message.sender != envelope.sender_id {
                bail!("consensus message relayed under another sender");
            }
            consensus_inbox
                .try_send(ConsensusInput::Message(message))
                .map_err(|_| anyhow!("consensus inbox full"))
        }),
    );
    transport.register_handler(
        MessageType::StateSubmission,
        Arc::new(move |envelope: NetworkMessage| -> anyhow::Result<()> {
            let state: StateSubmission = bincode::deserialize(&envelope.payload)?;
            inbox
                .try_send(ConsensusInput::State(state))
                .map_err(|_| anyhow!("consensus inbox full"))
        }),
    );
}

pub struct RoundDriver {
    engine: ConsensusEngine,
    aggregator: ReputationAggregator,
    sink: Box<dyn SummarySink>,
    bus: Arc<dyn ConsensusBus>,
    source: Option<Arc<dyn StateSource>>,
    outcomes: mpsc::UnboundedSender<RoundOutcome>,
}

impl RoundDriver {
    pub fn new(
        engine: ConsensusEngine,
        aggregator: ReputationAggregator,
        sink: Box<dyn SummarySink>,
        bus: Arc<dyn ConsensusBus>,
        source: Option<Arc<dyn StateSource>>,
        outcomes: mpsc::UnboundedSender<RoundOutcome>,
    ) -> Self {
        Self {
            engine,
            aggregator,
            sink,
            bus,
            source,
            outcomes,
        }
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    /// Run until `shutdown` flips to true or the inbox closes.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ConsensusInput>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.engine.config().round_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let timer = self
                .engine
                .round_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_millis())));

            tokio::select! {
                _ = ticker.tick() => self.start_round(),
                input = inbox.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                _ = sleep(timer.unwrap_or_default()), if timer.is_some() => self.handle_timeout(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.drain_finalized();
        }
        debug!("round driver stopped");
    }

    fn start_round(&mut self) {
        let now = now_millis();
        if let Some(source) = &self.source {
            match source.current_metrics() {
                Ok(Some(metrics)) => {
                    let identity = self.engine.identity().clone();
                    let mut state = StateSubmission::unsigned(identity.peer_id(), now, metrics);
                    identity.sign_state(&mut state);
                    match self.engine.submit_state(state.clone(), now) {
                        Ok(()) => self.bus.broadcast_state(&state),
                        Err(err) => warn!(error = %err, "local state rejected"),
                    }
                }
                Ok(None) => debug!("no local state this round"),
                Err(err) => warn!(error = %err, "state source failed"),
            }
        }
        let outbox = self.engine.begin_round(now);
        self.dispatch(outbox);
    }

    fn handle_input(&mut self, input: ConsensusInput) {
        let now = now_millis();
        match input {
            ConsensusInput::Message(message) => {
                let outbox = self.engine.handle_message(message, now);
                self.dispatch(outbox);
            }
            ConsensusInput::State(state) => {
                let node = state.node_id;
                if let Err(err) = self.engine.submit_state(state, now) {
                    debug!(node = %node, error = %err, "state submission dropped");
                }
            }
        }
    }

    fn handle_timeout(&mut self) {
        match self.engine.on_round_timeout(now_millis()) {
            Ok(outbox) => self.dispatch(outbox),
            Err(err) => {
                let _ = self.outcomes.send(RoundOutcome::Unavailable(err));
            }
        }
    }

    fn dispatch(&self, outbox: Vec<ConsensusMessage>) {
        for message in &outbox {
            self.bus.broadcast_consensus(message);
        }
    }

    fn drain_finalized(&mut self) {
        for round in self.engine.take_finalized() {
            let summary = RoundSummary::new(&round, self.aggregator.collective_summary(&round.batch));
            if let Err(err) = self.sink.publish(&summary) {
                warn!(error = %err, "summary sink failed");
            }
            match self.aggregator.apply_round_outcome(&round) {
                Ok(_) => self.aggregator.mirror_into(self.engine.directory()),
                Err(err) => warn!(error = %err, "failed to record reputation"),
            }
            let _ = self.outcomes.send(RoundOutcome::Finalized(summary));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::reputation::ReputationConfig;
    use crate::sink::TracingSink;
    use parking_lot::Mutex;
    use trustmesh_crypto::NodeIdentity;
    use trustmesh_network::{PeerDirectory, PeerRecord};

    #[derive(Default)]
    struct RecordingBus {
        consensus: Mutex<Vec<ConsensusMessage>>,
        states: Mutex<Vec<StateSubmission>>,
    }

    impl ConsensusBus for RecordingBus {
        fn broadcast_consensus(&self, message: &ConsensusMessage) {
            self.consensus.lock().push(message.clone());
        }

        fn broadcast_state(&self, state: &StateSubmission) {
            self.states.lock().push(state.clone());
        }
    }

    struct FixedSource(StateMetrics);

    impl StateSource for FixedSource {
        fn current_metrics(&self) -> anyhow::Result<Option<StateMetrics>> {
            Ok(Some(self.0))
        }
    }

    #[tokio::test]
    async fn test_lone_driver_finalizes_and_reports() {
        let identity = Arc::new(NodeIdentity::generate());
        let keys = identity.public_keys();
        let directory = Arc::new(PeerDirectory::new(PeerRecord::new(
            "127.0.0.1",
            7000,
            keys.signing,
            keys.agreement,
            now_millis(),
        )));
        let config = ConsensusConfig {
            round_interval_ms: 20,
            ..ConsensusConfig::default()
        };
        let engine = ConsensusEngine::new(identity.clone(), directory, config);
        let bus = Arc::new(RecordingBus::default());
        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
        let driver = RoundDriver::new(
            engine,
            ReputationAggregator::new(ReputationConfig::default()),
            Box::new(TracingSink),
            bus.clone(),
            Some(Arc::new(FixedSource(StateMetrics {
                coherence: 0.6,
                ..StateMetrics::default()
            }))),
            outcomes_tx,
        );

        let (_inbox_tx, inbox) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(driver.run(inbox, shutdown));

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .expect("round finished in time")
            .expect("outcome");
        match outcome {
            RoundOutcome::Finalized(summary) => {
                assert_eq!(summary.sequence, 1);
                assert_eq!(summary.summary.nodes_count, 1);
                assert!((summary.summary.metrics.coherence - 0.6).abs() < 1e-12);
            }
            RoundOutcome::Unavailable(err) => panic!("unexpected failure: {err}"),
        }
        assert!(!bus.states.lock().is_empty());
        assert!(!bus.consensus.lock().is_empty());

        shutdown_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver stops")
            .expect("join");
    }
}
