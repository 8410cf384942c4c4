//! Pending candidate buffer for scoutsync.
//!
//! Candidates often arrive before the handshake they belong to can use
//! them. This buffer holds them per key:
//! - FIFO order per key, drained in arrival order
//! - Bounded per key to prevent unbounded memory growth
//! - Age tracking so abandoned queues can be purged
//!
//! The same buffer serves both directions: inbound candidates keyed by the
//! sender, and locally discovered candidates keyed by session while the
//! remote's relay id is still unknown.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};
use sync_types::Candidate;
use thiserror::Error;

/// Default per-key capacity.
pub const DEFAULT_MAX_PER_KEY: usize = 64;

/// Error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The queue for this key is at capacity.
    #[error("candidate buffer full (capacity: {capacity})")]
    Full {
        /// Per-key capacity.
        capacity: usize,
    },
}

#[derive(Debug)]
struct Queue {
    first_at: Instant,
    items: VecDeque<Candidate>,
}

/// Candidate queues keyed by `K`.
#[derive(Debug)]
pub struct CandidateBuffer<K> {
    max_per_key: usize,
    queues: HashMap<K, Queue>,
}

impl<K: Eq + Hash + Clone> CandidateBuffer<K> {
    /// Create a buffer holding at most `max_per_key` candidates per key.
    pub fn new(max_per_key: usize) -> Self {
        Self {
            max_per_key,
            queues: HashMap::new(),
        }
    }

    /// Append a candidate to the key's queue.
    ///
    /// Returns an error if the queue is full; the candidate is not stored.
    pub fn push(&mut self, key: K, candidate: Candidate, now: Instant) -> Result<(), BufferError> {
        let queue = self.queues.entry(key).or_insert_with(|| Queue {
            first_at: now,
            items: VecDeque::new(),
        });
        if queue.items.len() >= self.max_per_key {
            return Err(BufferError::Full {
                capacity: self.max_per_key,
            });
        }
        queue.items.push_back(candidate);
        Ok(())
    }

    /// Remove and return every candidate for the key, oldest first.
    pub fn drain(&mut self, key: &K) -> Vec<Candidate> {
        self.queues
            .remove(key)
            .map(|q| q.items.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop the key's queue. Returns how many candidates were dropped.
    pub fn discard(&mut self, key: &K) -> usize {
        self.queues.remove(key).map(|q| q.items.len()).unwrap_or(0)
    }

    /// Drop queues whose first candidate is older than `max_age`.
    ///
    /// Returns the purged keys.
    pub fn purge_older_than(&mut self, now: Instant, max_age: Duration) -> Vec<K> {
        let expired: Vec<K> = self
            .queues
            .iter()
            .filter(|(_, q)| now.saturating_duration_since(q.first_at) > max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.queues.remove(key);
        }
        expired
    }

    /// Number of candidates queued for the key.
    pub fn len_for(&self, key: &K) -> usize {
        self.queues.get(key).map(|q| q.items.len()).unwrap_or(0)
    }

    /// Total candidates across all keys.
    pub fn total(&self) -> usize {
        self.queues.values().map(|q| q.items.len()).sum()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for CandidateBuffer<K> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_KEY)
    }
}
