//! Byzantine quorum arithmetic and per-phase vote tallies.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use trustmesh_types::PeerId;

/// Largest number of faulty members `n` can tolerate: `floor((n - 1) / 3)`.
pub fn fault_tolerance(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Matching votes needed to advance a phase: `2f + 1`.
pub fn quorum_size(n: usize) -> usize {
    2 * fault_tolerance(n) + 1
}

/// Sorted, duplicate-free member set of one round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Membership {
    members: Vec<PeerId>,
}

impl Membership {
    pub fn new(mut members: Vec<PeerId>) -> Self {
        members.sort();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.binary_search(peer).is_ok()
    }

    pub fn fault_tolerance(&self) -> usize {
        fault_tolerance(self.len())
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.len())
    }

    /// Distinct view-change requests that prove at least one honest member
    /// timed out.
    pub fn view_change_threshold(&self) -> usize {
        self.fault_tolerance() + 1
    }

    /// Leader of `view`: `members[view mod n]`.
    pub fn leader(&self, view: u64) -> Option<PeerId> {
        if self.members.is_empty() {
            return None;
        }
        let index = (view % self.members.len() as u64) as usize;
        Some(self.members[index])
    }
}

/// One phase's votes. Each voter is counted once; later votes are ignored.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    votes: HashMap<PeerId, [u8; 32]>,
}

impl VoteTally {
    /// Record `voter`'s vote. Returns false if the voter already voted.
    pub fn record(&mut self, voter: PeerId, digest: [u8; 32]) -> bool {
        match self.votes.entry(voter) {
            Entry::Vacant(slot) => {
                slot.insert(digest);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Votes matching `digest`.
    pub fn count(&self, digest: &[u8; 32]) -> usize {
        self.votes.values().filter(|vote| *vote == digest).count()
    }

    pub fn vote_of(&self, voter: &PeerId) -> Option<&[u8; 32]> {
        self.votes.get(voter)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}
