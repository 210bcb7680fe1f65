//! Bounded-concurrency admission queue for network transfers
//!
//! The queue decides *when* a transfer may start; it never performs one.
//! Every method that frees capacity returns the keys the caller must now
//! start, in the order they were queued.

use std::fmt::Debug;
use std::hash::Hash;

use indexmap::IndexSet;
use tracing::debug;

/// Result of offering a key to the network queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the caller must start the transfer now
    Started,
    /// No slot (or paused); the key waits in FIFO order
    Queued,
    /// The key is already queued or in flight
    Duplicate,
}

/// Result of withdrawing a key from the network queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The key was waiting and has been dropped from the queue
    Dequeued,
    /// The key is in flight; the caller must abort the transfer, whose
    /// terminal event then frees the slot through [`Network::finish`]
    AbortInFlight,
    /// The key is unknown
    NotFound,
}

/// Network queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Keys started directly by `add`
    pub started_directly: u64,

    /// Keys that had to wait in the queue
    pub queued_total: u64,

    /// Keys promoted from the queue after a slot freed
    pub promoted: u64,

    /// Transfers that reached a terminal state
    pub finished: u64,

    /// Current number of transfers in flight
    pub in_flight: usize,

    /// Current number of waiting keys
    pub queued: usize,
}

/// Admission queue bounding the number of concurrent transfers
///
/// # Example
///
/// ```
/// use imagekeep_scheduler::{Admission, Network};
///
/// let mut network = Network::new(1);
///
/// assert_eq!(network.add("a.png"), Admission::Started);
/// assert_eq!(network.add("b.png"), Admission::Queued);
///
/// // a.png finished: b.png takes its slot
/// assert_eq!(network.finish(&"a.png"), vec!["b.png"]);
/// ```
#[derive(Debug)]
pub struct Network<K> {
    max_loaders: usize,
    in_flight: IndexSet<K>,
    queue: IndexSet<K>,
    paused: bool,
    stats: NetworkStats,
}

impl<K: Hash + Eq + Clone + Debug> Network<K> {
    /// Create a queue allowing `max_loaders` concurrent transfers (at least one)
    pub fn new(max_loaders: usize) -> Self {
        Self {
            max_loaders: max_loaders.max(1),
            in_flight: IndexSet::new(),
            queue: IndexSet::new(),
            paused: false,
            stats: NetworkStats::default(),
        }
    }

    /// Offer a key for transfer
    pub fn add(&mut self, key: K) -> Admission {
        if self.contains(&key) {
            return Admission::Duplicate;
        }

        if !self.paused && self.has_capacity() {
            debug!(?key, in_flight = self.in_flight.len() + 1, "transfer admitted");
            self.in_flight.insert(key);
            self.stats.started_directly += 1;
            Admission::Started
        } else {
            debug!(?key, queued = self.queue.len() + 1, "transfer queued");
            self.queue.insert(key);
            self.stats.queued_total += 1;
            Admission::Queued
        }
    }

    /// Record that the transfer for `key` reached a terminal state
    ///
    /// Frees its slot and returns the queued keys promoted into flight.
    pub fn finish(&mut self, key: &K) -> Vec<K> {
        if self.in_flight.shift_remove(key) {
            self.stats.finished += 1;
        }
        self.drain()
    }

    /// Stop promoting queued keys; transfers in flight continue
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume promotion and return the keys started immediately
    pub fn resume(&mut self) -> Vec<K> {
        self.paused = false;
        self.drain()
    }

    /// Check if promotion is paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Withdraw a key from the queue, or report that it must be aborted
    pub fn remove(&mut self, key: &K) -> Removal {
        if self.queue.shift_remove(key) {
            Removal::Dequeued
        } else if self.in_flight.contains(key) {
            Removal::AbortInFlight
        } else {
            Removal::NotFound
        }
    }

    /// Empty the queue and return every in-flight key, which the caller
    /// must abort
    pub fn clear(&mut self) -> Vec<K> {
        self.queue.clear();
        self.in_flight.drain(..).collect()
    }

    /// Change the concurrency limit; returns keys promoted if it grew
    pub fn set_max_loaders(&mut self, max_loaders: usize) -> Vec<K> {
        self.max_loaders = max_loaders.max(1);
        self.drain()
    }

    /// Get the concurrency limit
    pub fn max_loaders(&self) -> usize {
        self.max_loaders
    }

    /// Check whether the key is queued or in flight
    pub fn contains(&self, key: &K) -> bool {
        self.in_flight.contains(key) || self.queue.contains(key)
    }

    /// Check whether the key is in flight
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains(key)
    }

    /// Check whether the key is waiting for a slot
    pub fn is_queued(&self, key: &K) -> bool {
        self.queue.contains(key)
    }

    /// Number of transfers in flight
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of keys waiting for a slot
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Waiting keys, oldest first
    pub fn queued(&self) -> impl Iterator<Item = &K> {
        self.queue.iter()
    }

    /// Get network statistics
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            in_flight: self.in_flight.len(),
            queued: self.queue.len(),
            ..self.stats
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_loaders
    }

    /// Promote the oldest queued keys while capacity and state allow
    fn drain(&mut self) -> Vec<K> {
        let mut promoted = Vec::new();
        while !self.paused && self.has_capacity() {
            let Some(key) = self.queue.shift_remove_index(0) else {
                break;
            };
            debug!(?key, "transfer promoted from queue");
            self.in_flight.insert(key.clone());
            self.stats.promoted += 1;
            promoted.push(key);
        }
        promoted
    }
}
