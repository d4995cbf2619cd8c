//! PBFT round state machine.
//!
//! The engine is a synchronous state machine owned by a single task. Every
//! entry point takes the current time in milliseconds and returns the
//! messages the caller must broadcast; the node's own votes are counted
//! directly and never looped back through the network.
//!
//! Per `(view, sequence)` a round moves `PrePrepare -> Prepare -> Commit ->
//! Finalized`. Votes are tallied once per member and phase. Votes that
//! arrive before their phase is active stay in the tally and are counted
//! once the phase is reached; messages for a later view or sequence are
//! buffered and replayed when that round starts.
//!
//! A view change carries the sender's highest prepared certificate for the
//! sequence. The leader of a view entered that way proposes through a
//! `NewView` holding a quorum of view changes, and must re-propose the
//! highest prepared batch among them. Any batch that could have been
//! finalized in an earlier view was prepared by a quorum, so it survives
//! into every later view of the same sequence.
//!
//! Finalized sequences keep their commit certificate for a bounded history.
//! A member asking for a view change or a sync on a sequence the node
//! already finalized is answered with that certificate, and a node that
//! sees members running ahead asks for the certificates it is missing.

use crate::config::ConsensusConfig;
use crate::errors::{ConsensusError, SubmissionError};
use crate::messages::{
    batch_digest, ConsensusMessage, ConsensusPayload, Digest, PreparedCertificate, EMPTY_DIGEST,
};
use crate::quorum::{Membership, VoteTally};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use trustmesh_crypto::{verify_signature, NodeIdentity};
use trustmesh_network::PeerDirectory;
use trustmesh_types::{skew_millis, PeerId, StateSubmission};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PrePrepare,
    Prepare,
    Commit,
    Finalized,
    /// Waiting for the `NewView` of a view entered after a timeout.
    ViewChange,
}

/// A batch agreed by a quorum.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedRound {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub batch: Vec<StateSubmission>,
    pub members: Vec<PeerId>,
    /// Members whose commit vote for `digest` was counted.
    pub committers: Vec<PeerId>,
    /// Members with a matching prepare or commit vote.
    pub participants: Vec<PeerId>,
    pub finalized_at: u64,
}

#[derive(Debug)]
struct Proposal {
    digest: Digest,
    batch: Vec<StateSubmission>,
}

#[derive(Debug)]
struct Round {
    view: u64,
    sequence: u64,
    phase: Phase,
    members: Membership,
    started_at: u64,
    proposal: Option<Proposal>,
    prepares: VoteTally,
    commits: VoteTally,
    /// Signed votes behind the tallies, own votes included.
    prepare_votes: Vec<ConsensusMessage>,
    commit_votes: Vec<ConsensusMessage>,
}

impl Round {
    fn new(view: u64, sequence: u64, phase: Phase, members: Membership, started_at: u64) -> Self {
        Self {
            view,
            sequence,
            phase,
            members,
            started_at,
            proposal: None,
            prepares: VoteTally::default(),
            commits: VoteTally::default(),
            prepare_votes: Vec::new(),
            commit_votes: Vec::new(),
        }
    }

    fn key(&self) -> (u64, u64) {
        (self.sequence, self.view)
    }
}

/// Commit certificate of a finalized sequence.
#[derive(Debug, Clone)]
struct Decision {
    view: u64,
    digest: Digest,
    batch: Vec<StateSubmission>,
    commits: Vec<ConsensusMessage>,
}

pub struct ConsensusEngine {
    identity: Arc<NodeIdentity>,
    directory: Arc<PeerDirectory>,
    config: ConsensusConfig,
    view: u64,
    sequence: u64,
    view_changes: u32,
    /// The view moved during the current sequence; proposals need a `NewView`.
    view_changed: bool,
    round: Option<Round>,
    /// Highest prepared certificate for the current sequence.
    prepared: Option<PreparedCertificate>,
    pending: HashMap<PeerId, StateSubmission>,
    last_finalized: HashMap<PeerId, u64>,
    /// Messages for later rounds, keyed by `(sequence, view)`.
    future: BTreeMap<(u64, u64), Vec<ConsensusMessage>>,
    buffered: usize,
    /// Validated view-change messages for the current sequence, by requested view.
    view_votes: BTreeMap<u64, HashMap<PeerId, ConsensusMessage>>,
    decisions: BTreeMap<u64, Decision>,
    /// `(requester, sequence, view)` already answered with a certificate.
    served: HashSet<(PeerId, u64, u64)>,
    /// Highest sequence seen in a member's message.
    highest_seen: u64,
    /// `(own sequence, highest seen)` of the last sync request.
    sync_requested: Option<(u64, u64)>,
    finalized: VecDeque<FinalizedRound>,
}

impl ConsensusEngine {
    pub fn new(
        identity: Arc<NodeIdentity>,
        directory: Arc<PeerDirectory>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            identity,
            directory,
            config,
            view: 0,
            sequence: 1,
            view_changes: 0,
            view_changed: false,
            round: None,
            prepared: None,
            pending: HashMap::new(),
            last_finalized: HashMap::new(),
            future: BTreeMap::new(),
            buffered: 0,
            view_votes: BTreeMap::new(),
            decisions: BTreeMap::new(),
            served: HashSet::new(),
            highest_seen: 0,
            sync_requested: None,
            finalized: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    /// Sequence number of the next batch to finalize.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn phase(&self) -> Phase {
        self.round.as_ref().map_or(Phase::Idle, |round| round.phase)
    }

    /// View changes spent on the current sequence.
    pub fn view_changes(&self) -> u32 {
        self.view_changes
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.round.as_ref().map(|round| &round.members)
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.round
            .as_ref()
            .and_then(|round| round.members.leader(round.view))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Digest this node prepared for the current sequence, if any.
    pub fn prepared_digest(&self) -> Option<Digest> {
        self.prepared.as_ref().map(|cert| cert.digest)
    }

    /// When the active round times out, if one is in flight.
    pub fn round_deadline(&self) -> Option<u64> {
        self.round
            .as_ref()
            .filter(|round| round.phase != Phase::Finalized)
            .map(|round| round.started_at + self.config.round_timeout_ms)
    }

    /// Drain rounds finalized since the last call, oldest first.
    pub fn take_finalized(&mut self) -> Vec<FinalizedRound> {
        self.finalized.drain(..).collect()
    }

    /// Admit a signed state into the pending pool.
    ///
    /// Only the newest submission per node is kept; anything at or before
    /// the node's last finalized timestamp is a replay.
    pub fn submit_state(&mut self, state: StateSubmission, now: u64) -> Result<(), SubmissionError> {
        self.validate_submission(&state, now)?;
        if let Some(existing) = self.pending.get(&state.node_id) {
            if existing.timestamp >= state.timestamp {
                return Err(SubmissionError::Replayed {
                    node: state.node_id,
                    timestamp: state.timestamp,
                });
            }
        }
        debug!(node = %state.node_id, timestamp = state.timestamp, "state submission accepted");
        self.pending.insert(state.node_id, state);
        Ok(())
    }

    /// Start a round for the current `(view, sequence)` unless one is
    /// already in flight. The leader proposes immediately.
    pub fn begin_round(&mut self, now: u64) -> Vec<ConsensusMessage> {
        let mut outbox = Vec::new();
        if self.round_in_flight() {
            return outbox;
        }
        self.start_round(now, &mut outbox);
        outbox
    }

    /// Process one authenticated-envelope payload.
    pub fn handle_message(&mut self, message: ConsensusMessage, now: u64) -> Vec<ConsensusMessage> {
        let mut outbox = Vec::new();
        if message.sender == self.local_id() || !self.authenticate(&message) {
            return outbox;
        }
        if message.sequence > self.sequence && self.is_member(&message.sender) {
            self.note_ahead(message.sequence, &mut outbox);
        }
        if matches!(message.payload, ConsensusPayload::ViewChange { .. }) {
            self.on_view_change(message, now, &mut outbox);
        } else if matches!(message.payload, ConsensusPayload::SyncRequest) {
            self.on_sync_request(&message, &mut outbox);
        } else if matches!(message.payload, ConsensusPayload::Decided { .. }) {
            self.on_decided(message, now, &mut outbox);
        } else {
            self.on_vote(message, now, &mut outbox);
        }
        outbox
    }

    /// The round timer expired before finalization.
    ///
    /// Discards the round, moves to the next view and asks peers to follow.
    /// Once `max_view_changes` views have failed for this sequence the
    /// round is abandoned and `ConsensusError::Unavailable` returned; the
    /// next `begin_round` requests the following view.
    pub fn on_round_timeout(&mut self, now: u64) -> Result<Vec<ConsensusMessage>, ConsensusError> {
        if !self.round_in_flight() {
            return Ok(Vec::new());
        }
        self.view_changes += 1;
        if self.view_changes > self.config.max_view_changes {
            let err = ConsensusError::Unavailable {
                view: self.view,
                sequence: self.sequence,
                view_changes: self.view_changes,
            };
            self.round = None;
            self.view += 1;
            self.view_changed = true;
            self.view_changes = 0;
            let view = self.view;
            self.view_votes.retain(|requested, _| *requested >= view);
            return Err(err);
        }

        warn!(
            view = self.view,
            next_view = self.view + 1,
            sequence = self.sequence,
            "round timed out, changing view"
        );
        let mut outbox = Vec::new();
        self.enter_view(self.view + 1, now, &mut outbox);
        Ok(outbox)
    }

    fn round_in_flight(&self) -> bool {
        self.round
            .as_ref()
            .is_some_and(|round| round.phase != Phase::Finalized)
    }

    fn current_members(&self) -> Membership {
        match &self.round {
            Some(round) => round.members.clone(),
            None => Membership::new(self.directory.live_members()),
        }
    }

    fn is_member(&self, peer: &PeerId) -> bool {
        match &self.round {
            Some(round) => round.members.contains(peer),
            None => self.directory.live_members().contains(peer),
        }
    }

    fn authenticate(&self, message: &ConsensusMessage) -> bool {
        let Some(record) = self.directory.get(&message.sender) else {
            debug!(sender = %message.sender, "consensus message from unknown peer");
            return false;
        };
        if !message.verify(&record.signing_key) {
            debug!(sender = %message.sender, kind = message.payload.name(), "bad consensus signature");
            return false;
        }
        true
    }

    fn validate_submission(&self, state: &StateSubmission, now: u64) -> Result<(), SubmissionError> {
        if !state.is_well_formed() {
            return Err(SubmissionError::Malformed(state.node_id));
        }
        let record = self
            .directory
            .get(&state.node_id)
            .ok_or(SubmissionError::UnknownNode(state.node_id))?;
        if !verify_signature(&state.signing_bytes(), &state.signature, &record.signing_key) {
            return Err(SubmissionError::InvalidSignature(state.node_id));
        }
        if skew_millis(state.timestamp, now) > self.config.freshness_window_ms {
            return Err(SubmissionError::Stale {
                timestamp: state.timestamp,
                now,
            });
        }
        if let Some(last) = self.last_finalized.get(&state.node_id) {
            if state.timestamp <= *last {
                return Err(SubmissionError::Replayed {
                    node: state.node_id,
                    timestamp: state.timestamp,
                });
            }
        }
        Ok(())
    }

    fn validate_batch(&self, batch: &[StateSubmission], now: u64) -> Result<(), SubmissionError> {
        if batch.len() > self.config.max_batch_size {
            return Err(SubmissionError::BatchTooLarge {
                size: batch.len(),
                limit: self.config.max_batch_size,
            });
        }
        let mut seen = HashSet::with_capacity(batch.len());
        for state in batch {
            if !seen.insert(state.node_id) {
                return Err(SubmissionError::Duplicate(state.node_id));
            }
            self.validate_submission(state, now)?;
        }
        Ok(())
    }

    /// Authenticated votes of kind `kind` for `(view, sequence, digest)`,
    /// one per member, if they reach a quorum of `members`.
    fn certified_votes(
        &self,
        members: &Membership,
        votes: &[ConsensusMessage],
        kind: &ConsensusPayload,
        view: u64,
        sequence: u64,
        digest: &Digest,
    ) -> Option<Vec<ConsensusMessage>> {
        let mut voters = HashSet::new();
        let mut certified = Vec::new();
        for vote in votes {
            if vote.payload != *kind
                || vote.view != view
                || vote.sequence != sequence
                || vote.digest != *digest
            {
                continue;
            }
            if !members.contains(&vote.sender) || voters.contains(&vote.sender) || !self.authenticate(vote) {
                continue;
            }
            voters.insert(vote.sender);
            certified.push(vote.clone());
        }
        (certified.len() >= members.quorum()).then_some(certified)
    }

    /// A signed view change for `view` of the current sequence whose
    /// prepared certificate, if any, holds up.
    fn valid_view_change(&self, members: &Membership, message: &ConsensusMessage, view: u64) -> bool {
        let ConsensusPayload::ViewChange { prepared } = &message.payload else {
            return false;
        };
        if message.view != view || message.sequence != self.sequence || !members.contains(&message.sender) {
            return false;
        }
        if !self.authenticate(message) {
            return false;
        }
        match prepared {
            None => message.digest == EMPTY_DIGEST,
            Some(cert) => {
                cert.digest == message.digest
                    && cert.view < message.view
                    && batch_digest(&cert.batch) == cert.digest
                    && self
                        .certified_votes(
                            members,
                            &cert.prepares,
                            &ConsensusPayload::Prepare,
                            cert.view,
                            message.sequence,
                            &cert.digest,
                        )
                        .is_some()
            }
        }
    }

    fn start_round(&mut self, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let members = Membership::new(self.directory.live_members());
        let leader = members.leader(self.view);
        info!(
            view = self.view,
            sequence = self.sequence,
            members = members.len(),
            quorum = members.quorum(),
            leader = ?leader,
            "round started"
        );
        let waiting = if self.view_changed {
            Phase::ViewChange
        } else {
            Phase::PrePrepare
        };
        self.round = Some(Round::new(self.view, self.sequence, waiting, members, now));
        let view = self.view;
        self.view_votes.retain(|requested, _| *requested >= view);

        if self.view_changed {
            self.request_view(outbox);
            self.try_new_view(now, outbox);
        } else if leader == Some(self.local_id()) {
            self.propose(now, outbox);
        }
        self.replay_buffered(now, outbox);
    }

    /// Fresh submissions from the pending pool, in digest order.
    fn fresh_batch(&self, now: u64) -> Vec<StateSubmission> {
        let window = self.config.freshness_window_ms;
        let mut batch: Vec<StateSubmission> = self
            .pending
            .values()
            .filter(|state| skew_millis(state.timestamp, now) <= window)
            .cloned()
            .collect();
        batch.sort_by_key(|state| (state.node_id, state.timestamp));
        batch.truncate(self.config.max_batch_size);
        batch
    }

    fn propose(&mut self, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let batch = self.fresh_batch(now);
        let digest = batch_digest(&batch);

        let Some(round) = self.round.as_ref() else {
            return;
        };
        debug!(view = round.view, sequence = round.sequence, size = batch.len(), "proposing batch");
        outbox.push(ConsensusMessage::signed(
            &self.identity,
            ConsensusPayload::PrePrepare {
                batch: batch.clone(),
            },
            round.view,
            round.sequence,
            digest,
        ));
        self.accept_proposal(digest, batch, now, outbox);
    }

    fn accept_proposal(
        &mut self,
        digest: Digest,
        batch: Vec<StateSubmission>,
        now: u64,
        outbox: &mut Vec<ConsensusMessage>,
    ) {
        let local = self.local_id();
        let Some(round) = self.round.as_mut() else {
            return;
        };
        round.proposal = Some(Proposal { digest, batch });
        round.phase = Phase::Prepare;
        let prepare = ConsensusMessage::signed(
            &self.identity,
            ConsensusPayload::Prepare,
            round.view,
            round.sequence,
            digest,
        );
        if round.prepares.record(local, digest) {
            round.prepare_votes.push(prepare.clone());
        }
        outbox.push(prepare);
        self.advance(now, outbox);
    }

    fn on_vote(&mut self, message: ConsensusMessage, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let key = (message.sequence, message.view);
        let current = (self.sequence, self.view);
        if key < current {
            debug!(
                sender = %message.sender,
                kind = message.payload.name(),
                view = message.view,
                sequence = message.sequence,
                "discarding vote for superseded round"
            );
            return;
        }
        if key > current {
            self.buffer(message);
            return;
        }
        if self.round.as_ref().map(Round::key) != Some(current) {
            self.start_round(now, outbox);
        }

        let Some(round) = self.round.as_ref() else {
            return;
        };
        if round.phase == Phase::Finalized {
            return;
        }
        if !round.members.contains(&message.sender) {
            debug!(sender = %message.sender, "vote from outside the round membership");
            return;
        }

        if matches!(message.payload, ConsensusPayload::Prepare | ConsensusPayload::Commit) {
            self.record_vote(message, now, outbox);
            return;
        }
        let (sender, digest) = (message.sender, message.digest);
        match message.payload {
            ConsensusPayload::PrePrepare { batch } => {
                self.on_pre_prepare(sender, digest, batch, now, outbox);
            }
            ConsensusPayload::NewView { view_changes, batch } => {
                self.on_new_view(sender, digest, &view_changes, batch, now, outbox);
            }
            _ => {}
        }
    }

    fn record_vote(&mut self, message: ConsensusMessage, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let is_prepare = matches!(message.payload, ConsensusPayload::Prepare);
        let (tally, votes) = if is_prepare {
            (&mut round.prepares, &mut round.prepare_votes)
        } else {
            (&mut round.commits, &mut round.commit_votes)
        };
        if !tally.record(message.sender, message.digest) {
            debug!(sender = %message.sender, kind = message.payload.name(), "duplicate vote ignored");
            return;
        }
        votes.push(message);
        self.advance(now, outbox);
    }

    fn on_pre_prepare(
        &mut self,
        sender: PeerId,
        digest: Digest,
        batch: Vec<StateSubmission>,
        now: u64,
        outbox: &mut Vec<ConsensusMessage>,
    ) {
        let Some(round) = self.round.as_ref() else {
            return;
        };
        if round.members.leader(round.view) != Some(sender) {
            debug!(sender = %sender, view = round.view, "pre-prepare from non-leader");
            return;
        }
        if round.proposal.is_some() {
            return;
        }
        if self.view_changed {
            debug!(sender = %sender, view = round.view, "pre-prepare without new-view after a view change");
            return;
        }
        if batch_digest(&batch) != digest {
            warn!(leader = %sender, "pre-prepare digest does not match its batch");
            return;
        }
        if let Err(err) = self.validate_batch(&batch, now) {
            warn!(leader = %sender, error = %err, "rejecting proposed batch");
            return;
        }
        self.accept_proposal(digest, batch, now, outbox);
    }

    fn on_new_view(
        &mut self,
        sender: PeerId,
        digest: Digest,
        view_changes: &[ConsensusMessage],
        batch: Vec<StateSubmission>,
        now: u64,
        outbox: &mut Vec<ConsensusMessage>,
    ) {
        let Some(round) = self.round.as_ref() else {
            return;
        };
        if round.members.leader(round.view) != Some(sender) {
            debug!(sender = %sender, view = round.view, "new-view from non-leader");
            return;
        }
        if round.proposal.is_some() {
            return;
        }
        if batch_digest(&batch) != digest {
            warn!(leader = %sender, "new-view digest does not match its batch");
            return;
        }
        let (members, view) = (round.members.clone(), round.view);

        let mut senders = HashSet::new();
        let mut highest: Option<&PreparedCertificate> = None;
        for message in view_changes {
            if !self.valid_view_change(&members, message, view) || !senders.insert(message.sender) {
                continue;
            }
            if let Some(cert) = message.prepared_certificate() {
                if highest.map_or(true, |best| cert.view > best.view) {
                    highest = Some(cert);
                }
            }
        }
        if senders.len() < members.quorum() {
            warn!(leader = %sender, view, view_changes = senders.len(), "new-view without a quorum of view changes");
            return;
        }
        match highest {
            Some(cert) if cert.digest != digest => {
                warn!(leader = %sender, view, prepared_view = cert.view, "new-view drops a prepared batch");
                return;
            }
            Some(_) => {}
            None => {
                if let Err(err) = self.validate_batch(&batch, now) {
                    warn!(leader = %sender, error = %err, "rejecting proposed batch");
                    return;
                }
            }
        }
        self.accept_proposal(digest, batch, now, outbox);
    }

    fn advance(&mut self, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let local = self.local_id();
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let Some(proposal) = round.proposal.as_ref() else {
            return;
        };
        let digest = proposal.digest;
        let quorum = round.members.quorum();

        if round.phase == Phase::Prepare && round.prepares.count(&digest) >= quorum {
            debug!(view = round.view, sequence = round.sequence, "prepare quorum reached");
            let cert = PreparedCertificate {
                view: round.view,
                digest,
                batch: proposal.batch.clone(),
                prepares: round
                    .prepare_votes
                    .iter()
                    .filter(|vote| vote.digest == digest)
                    .cloned()
                    .collect(),
            };
            round.phase = Phase::Commit;
            let commit = ConsensusMessage::signed(
                &self.identity,
                ConsensusPayload::Commit,
                round.view,
                round.sequence,
                digest,
            );
            if round.commits.record(local, digest) {
                round.commit_votes.push(commit.clone());
            }
            outbox.push(commit);
            if self.prepared.as_ref().map_or(true, |held| cert.view >= held.view) {
                self.prepared = Some(cert);
            }
        }

        let Some(round) = self.round.as_mut() else {
            return;
        };
        if round.phase == Phase::Commit && round.commits.count(&digest) >= quorum {
            round.phase = Phase::Finalized;
            self.finalize(now);
        }
    }

    fn finalize(&mut self, now: u64) {
        let Some(round) = self.round.as_ref() else {
            return;
        };
        let Some(proposal) = round.proposal.as_ref() else {
            return;
        };

        for state in &proposal.batch {
            let last = self.last_finalized.entry(state.node_id).or_insert(0);
            *last = (*last).max(state.timestamp);
            if self
                .pending
                .get(&state.node_id)
                .is_some_and(|pending| pending.timestamp <= state.timestamp)
            {
                self.pending.remove(&state.node_id);
            }
        }

        let matches = |tally: &VoteTally, member: &PeerId| tally.vote_of(member) == Some(&proposal.digest);
        let committers: Vec<PeerId> = round
            .members
            .members()
            .iter()
            .filter(|member| matches(&round.commits, member))
            .copied()
            .collect();
        let participants: Vec<PeerId> = round
            .members
            .members()
            .iter()
            .filter(|member| matches(&round.commits, member) || matches(&round.prepares, member))
            .copied()
            .collect();
        let decision = Decision {
            view: round.view,
            digest: proposal.digest,
            batch: proposal.batch.clone(),
            commits: round
                .commit_votes
                .iter()
                .filter(|vote| vote.digest == proposal.digest)
                .cloned()
                .collect(),
        };
        let outcome = FinalizedRound {
            view: round.view,
            sequence: round.sequence,
            digest: proposal.digest,
            batch: proposal.batch.clone(),
            members: round.members.members().to_vec(),
            committers,
            participants,
            finalized_at: now,
        };
        info!(
            view = outcome.view,
            sequence = outcome.sequence,
            states = outcome.batch.len(),
            digest = %hex::encode(&outcome.digest[..8]),
            "round finalized"
        );

        self.decisions.insert(outcome.sequence, decision);
        while self.decisions.len() > self.config.certificate_history {
            self.decisions.pop_first();
        }
        if let Some(oldest) = self.decisions.keys().next().copied() {
            self.served.retain(|(_, sequence, _)| *sequence >= oldest);
        }

        self.view = outcome.view;
        self.sequence = outcome.sequence + 1;
        self.finalized.push_back(outcome);
        self.view_changes = 0;
        self.view_changed = false;
        self.prepared = None;
        self.view_votes.clear();
    }

    fn on_view_change(&mut self, message: ConsensusMessage, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        if message.sequence < self.sequence {
            if self.is_member(&message.sender) {
                self.serve_decision(message.sender, message.sequence, message.view, outbox);
            }
            return;
        }
        let view_horizon = self.view + u64::from(self.config.max_view_changes) + 1;
        if message.sequence > self.sequence || message.view < self.view || message.view > view_horizon {
            return;
        }
        let members = self.current_members();
        if !self.valid_view_change(&members, &message, message.view) {
            debug!(sender = %message.sender, view = message.view, "invalid view change");
            return;
        }

        let requested = message.view;
        let votes = self.view_votes.entry(requested).or_default();
        if votes.contains_key(&message.sender) {
            return;
        }
        votes.insert(message.sender, message);
        let requests = votes.len();

        if requested > self.view {
            if requests >= members.view_change_threshold() {
                warn!(
                    view = self.view,
                    next_view = requested,
                    sequence = self.sequence,
                    requests,
                    "joining view change"
                );
                self.enter_view(requested, now, outbox);
            }
        } else {
            self.try_new_view(now, outbox);
        }
    }

    fn enter_view(&mut self, view: u64, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        self.view = view;
        self.view_changed = true;
        self.round = None;
        self.start_round(now, outbox);
    }

    /// Broadcast and record this node's view change for the current view.
    fn request_view(&mut self, outbox: &mut Vec<ConsensusMessage>) {
        let message = ConsensusMessage::view_change(&self.identity, self.view, self.sequence, self.prepared.clone());
        let local = self.local_id();
        self.view_votes
            .entry(self.view)
            .or_default()
            .insert(local, message.clone());
        outbox.push(message);
    }

    /// As leader of a view entered through a view change, propose once a
    /// quorum of view changes is in.
    fn try_new_view(&mut self, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let local = self.local_id();
        let Some(round) = self.round.as_ref() else {
            return;
        };
        if round.phase != Phase::ViewChange
            || round.proposal.is_some()
            || round.members.leader(round.view) != Some(local)
        {
            return;
        }
        let Some(votes) = self.view_votes.get(&round.view) else {
            return;
        };
        let view_changes: Vec<ConsensusMessage> = votes
            .values()
            .filter(|message| round.members.contains(&message.sender))
            .cloned()
            .collect();
        if view_changes.len() < round.members.quorum() {
            return;
        }

        let (view, sequence) = (round.view, round.sequence);
        let highest = view_changes
            .iter()
            .filter_map(ConsensusMessage::prepared_certificate)
            .max_by_key(|cert| cert.view)
            .cloned();
        let batch = match highest {
            Some(cert) => {
                info!(view, sequence, prepared_view = cert.view, "re-proposing prepared batch");
                cert.batch
            }
            None => self.fresh_batch(now),
        };
        let digest = batch_digest(&batch);
        debug!(view, sequence, size = batch.len(), view_changes = view_changes.len(), "sending new-view");
        outbox.push(ConsensusMessage::signed(
            &self.identity,
            ConsensusPayload::NewView {
                view_changes,
                batch: batch.clone(),
            },
            view,
            sequence,
            digest,
        ));
        self.accept_proposal(digest, batch, now, outbox);
    }

    fn note_ahead(&mut self, sequence: u64, outbox: &mut Vec<ConsensusMessage>) {
        self.highest_seen = self.highest_seen.max(sequence);
        if sequence > self.sequence + 1 {
            self.request_sync(outbox);
        }
    }

    /// Ask members for the certificate of the current sequence, once per
    /// sequence and highest sequence seen.
    fn request_sync(&mut self, outbox: &mut Vec<ConsensusMessage>) {
        let marker = (self.sequence, self.highest_seen);
        if self.sync_requested == Some(marker) {
            return;
        }
        self.sync_requested = Some(marker);
        debug!(sequence = self.sequence, highest_seen = self.highest_seen, "requesting commit certificates");
        outbox.push(ConsensusMessage::signed(
            &self.identity,
            ConsensusPayload::SyncRequest,
            self.view,
            self.sequence,
            EMPTY_DIGEST,
        ));
    }

    fn on_sync_request(&mut self, message: &ConsensusMessage, outbox: &mut Vec<ConsensusMessage>) {
        if message.sequence < self.sequence && self.is_member(&message.sender) {
            self.serve_decision(message.sender, message.sequence, message.view, outbox);
        }
    }

    /// Answer a member stuck on `sequence` with its commit certificate.
    fn serve_decision(
        &mut self,
        requester: PeerId,
        sequence: u64,
        view: u64,
        outbox: &mut Vec<ConsensusMessage>,
    ) {
        let Some(decision) = self.decisions.get(&sequence) else {
            debug!(peer = %requester, sequence, "no certificate kept for requested sequence");
            return;
        };
        if self.served.len() >= self.config.max_buffered_messages {
            self.served.clear();
        }
        if !self.served.insert((requester, sequence, view)) {
            return;
        }
        debug!(peer = %requester, sequence, "sending commit certificate");
        outbox.push(ConsensusMessage::signed(
            &self.identity,
            ConsensusPayload::Decided {
                batch: decision.batch.clone(),
                commits: decision.commits.clone(),
            },
            decision.view,
            sequence,
            decision.digest,
        ));
    }

    fn on_decided(&mut self, message: ConsensusMessage, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        if message.sequence != self.sequence {
            return;
        }
        let ConsensusPayload::Decided { batch, commits } = message.payload else {
            return;
        };
        if batch_digest(&batch) != message.digest {
            warn!(sender = %message.sender, sequence = message.sequence, "certificate digest does not match its batch");
            return;
        }
        let members = self.current_members();
        let Some(certified) = self.certified_votes(
            &members,
            &commits,
            &ConsensusPayload::Commit,
            message.view,
            message.sequence,
            &message.digest,
        ) else {
            warn!(sender = %message.sender, sequence = message.sequence, "commit certificate without a quorum");
            return;
        };

        info!(
            sequence = message.sequence,
            view = message.view,
            from = %message.sender,
            "catching up from commit certificate"
        );
        let mut round = Round::new(message.view, message.sequence, Phase::Finalized, members, now);
        for vote in &certified {
            round.commits.record(vote.sender, vote.digest);
        }
        round.commit_votes = certified;
        round.proposal = Some(Proposal {
            digest: message.digest,
            batch,
        });
        self.round = Some(round);
        self.finalize(now);

        if self.highest_seen >= self.sequence {
            self.request_sync(outbox);
        }
    }

    fn buffer(&mut self, message: ConsensusMessage) {
        let view_horizon = self.view + u64::from(self.config.max_view_changes) + 1;
        if message.sequence > self.sequence + 1 || message.view > view_horizon {
            debug!(sender = %message.sender, view = message.view, sequence = message.sequence, "vote too far ahead");
            return;
        }
        if self.buffered >= self.config.max_buffered_messages {
            debug!(sender = %message.sender, "consensus buffer full");
            return;
        }
        self.future
            .entry((message.sequence, message.view))
            .or_default()
            .push(message);
        self.buffered += 1;
    }

    fn replay_buffered(&mut self, now: u64, outbox: &mut Vec<ConsensusMessage>) {
        let current = (self.sequence, self.view);
        let later = self.future.split_off(&current);
        let stale = std::mem::replace(&mut self.future, later);
        let ready = self.future.remove(&current).unwrap_or_default();
        self.buffered = self.future.values().map(Vec::len).sum();
        if !stale.is_empty() {
            debug!(rounds = stale.len(), "dropped buffered votes for superseded rounds");
        }
        for message in ready {
            self.on_vote(message, now, outbox);
        }
    }
}
