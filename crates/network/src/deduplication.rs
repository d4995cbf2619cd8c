use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Bounded cache of envelope keys already delivered.
///
/// Keys expire after `retention` and the oldest key is evicted first once
/// `max_size` is reached.
#[derive(Debug)]
pub struct MessageDeduplicator {
    state: Mutex<SeenSet>,
    retention: Duration,
    max_size: usize,
}

#[derive(Debug, Default)]
struct SeenSet {
    keys: HashSet<[u8; 32]>,
    order: VecDeque<([u8; 32], Instant)>,
}

impl SeenSet {
    fn expire(&mut self, now: Instant, retention: Duration) {
        while let Some((key, seen_at)) = self.order.front().copied() {
            if now.duration_since(seen_at) < retention {
                break;
            }
            self.order.pop_front();
            self.keys.remove(&key);
        }
    }
}

impl MessageDeduplicator {
    pub fn new(retention: Duration, max_size: usize) -> Self {
        Self {
            state: Mutex::new(SeenSet::default()),
            retention,
            max_size: max_size.max(1),
        }
    }

    /// Returns true the first time `key` is seen, false for duplicates.
    pub fn check_and_mark(&self, key: [u8; 32]) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.expire(now, self.retention);

        if state.keys.contains(&key) {
            return false;
        }
        while state.keys.len() >= self.max_size {
            match state.order.pop_front() {
                Some((oldest, _)) => {
                    state.keys.remove(&oldest);
                }
                None => break,
            }
        }
        state.keys.insert(key);
        state.order.push_back((key, now));
        true
    }

    pub fn has_seen(&self, key: &[u8; 32]) -> bool {
        self.state.lock().keys.contains(key)
    }

    pub fn size(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.keys.clear();
        state.order.clear();
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 10_000)
    }
}
