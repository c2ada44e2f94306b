//! Forwarded signal store
//!
//! Remembers which signaling exchanges this node relayed so that loops and
//! unroutable/TTL-exceeded responses can be attributed to them. Bounded
//! FIFO: the oldest entry is evicted when full, and entries are time-ordered
//! so expired ones are purged in one sweep from the front.

use crate::network::message::SignalId;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Default number of remembered forwards
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default lifetime of a remembered forward
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10);

/// Dedup key of a forwarded signal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardedSignal {
    pub sender_id: SignalId,
    pub recipient_id: SignalId,
    pub nonce: u32,
}

impl ForwardedSignal {
    pub fn new(sender_id: &str, recipient_id: &str, nonce: u32) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            nonce,
        }
    }
}

#[derive(Debug)]
pub struct SignalStore {
    max_size: usize,
    max_age: Duration,
    /// Insertion order, oldest first
    queue: VecDeque<ForwardedSignal>,
    /// Last time each signal was forwarded
    store: HashMap<ForwardedSignal, Instant>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(max_size: usize, max_age: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_age,
            queue: VecDeque::with_capacity(max_size.min(DEFAULT_CAPACITY)),
            store: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Record a forward, refreshing it if already known.
    pub fn add(&mut self, sender_id: &str, recipient_id: &str, nonce: u32) {
        let signal = ForwardedSignal::new(sender_id, recipient_id, nonce);
        let now = Instant::now();

        if self.store.contains_key(&signal) {
            self.queue.retain(|queued| queued != &signal);
            self.queue.push_back(signal.clone());
            self.store.insert(signal, now);
            return;
        }

        if self.queue.len() >= self.max_size {
            if let Some(oldest) = self.queue.pop_front() {
                self.store.remove(&oldest);
            }
        }

        self.queue.push_back(signal.clone());
        self.store.insert(signal, now);
    }

    /// Membership test without expiry check
    pub fn contains(&self, sender_id: &str, recipient_id: &str, nonce: u32) -> bool {
        self.store
            .contains_key(&ForwardedSignal::new(sender_id, recipient_id, nonce))
    }

    /// True if the signal was forwarded within the max age. An expired hit
    /// purges it together with everything queued before it.
    pub fn was_recently_forwarded(&mut self, sender_id: &str, recipient_id: &str, nonce: u32) -> bool {
        let signal = ForwardedSignal::new(sender_id, recipient_id, nonce);
        let Some(last_seen) = self.store.get(&signal).copied() else {
            return false;
        };

        if last_seen.elapsed() < self.max_age {
            return true;
        }

        while let Some(oldest) = self.queue.pop_front() {
            self.store.remove(&oldest);
            if oldest == signal {
                break;
            }
        }
        false
    }
}

impl Default for SignalStore {
    fn default() -> Self {
        Self::new()
    }
}
