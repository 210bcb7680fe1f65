//! Cancellation tokens for in-flight transfers
//!
//! Provides cancellation tokens that allow running transfers to be cancelled
//! cooperatively. Worker threads check the token between reads and stop
//! early once it is set.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation token for cooperative cancellation
///
/// Workers can periodically check `is_cancelled()` to determine if they
/// should stop processing. Clones share the same cancellation state.
///
/// # Example
///
/// ```
/// use imagekeep_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new token in the non-cancelled state
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel this token and every clone of it
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if this token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry associating keys with the token of their running transfer
///
/// Registering a key that is already present cancels the previous token,
/// so a restarted transfer never races a stale worker.
#[derive(Debug)]
pub struct CancellationRegistry<K> {
    tokens: HashMap<K, CancellationToken>,
}

impl<K: Hash + Eq> CancellationRegistry<K> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    /// Register a key and return the token handed to its worker
    pub fn register(&mut self, key: K) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.tokens.insert(key, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the token for `key`
    ///
    /// Returns `true` if the key was registered.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.tokens.remove(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered token
    ///
    /// Returns the number of tokens cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.tokens.len();
        for (_, token) in self.tokens.drain() {
            token.cancel();
        }
        count
    }

    /// Forget a key without cancelling it (its transfer finished)
    pub fn unregister(&mut self, key: &K) -> bool {
        self.tokens.remove(key).is_some()
    }

    /// Forget `key` only while it still maps to `token`
    ///
    /// A worker finishing after its key was re-registered leaves the newer
    /// token in place.
    pub fn release(&mut self, key: &K, token: &CancellationToken) -> bool {
        let current = self
            .tokens
            .get(key)
            .is_some_and(|registered| Arc::ptr_eq(&registered.cancelled, &token.cancelled));
        if current {
            self.tokens.remove(key);
        }
        current
    }

    /// Get the number of registered keys
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl<K: Hash + Eq> Default for CancellationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}
