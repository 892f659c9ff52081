//! Keyed registry of decay counters.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::counter::{DecayCounter, DecayTask};
use super::decision::Decision;
use crate::config::{LimiterConfig, Limits};
use crate::error::Result;

/// Per-key burst limiter.
///
/// Each key gets its own decay counter the first time it is seen. The
/// counter's decay process removes the key again once its usage has fully
/// decayed, so memory is bounded by the number of recently active keys.
///
/// Cloning is cheap and every clone shares the same state. When the last
/// clone is dropped, all decay processes stop.
pub struct RateLimiter<K> {
    shared: Arc<Shared<K>>,
}

struct Shared<K> {
    /// Decay counters indexed by key
    counters: RwLock<HashMap<K, Arc<DecayCounter>>>,
    limits: Limits,
    /// Runtime that hosts the decay processes
    runtime: Handle,
    /// Shared cancellation scope for every decay process
    shutdown: watch::Sender<bool>,
    /// Number of decay processes currently running
    live: Arc<AtomicUsize>,
}

impl<K> Clone for RateLimiter<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a limiter admitting `max_burst` calls per key, restoring one
    /// unit every `period`.
    ///
    /// Must be called from within a tokio runtime. Fails if `max_burst` does
    /// not fit in an `i32`.
    pub fn new(max_burst: u64, period: Duration) -> Result<Self> {
        Self::from_config(&LimiterConfig::new(max_burst, period))
    }

    /// Create a limiter from configuration, on the current tokio runtime.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        Self::with_runtime(config, Handle::try_current()?)
    }

    /// Create a limiter whose decay processes run on `runtime`.
    pub fn with_runtime(config: &LimiterConfig, runtime: Handle) -> Result<Self> {
        let limits = config.limits()?;
        let (shutdown, _) = watch::channel(false);

        debug!(
            max_burst = limits.max_burst,
            period_ms = limits.period.as_millis() as u64,
            "Rate limiter initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                counters: RwLock::new(HashMap::new()),
                limits,
                runtime,
                shutdown,
                live: Arc::new(AtomicUsize::new(0)),
            }),
        })
    }

    /// Try to admit one call for `key`.
    ///
    /// Never blocks on other callers and never fails.
    pub fn try_acquire(&self, key: &K) -> Decision {
        let existing = self.shared.counters.read().get(key).cloned();

        let counter = match existing {
            Some(counter) => counter,
            None => self.create_counter(key),
        };

        let decision = counter.try_admit();
        match decision {
            Decision::Admitted => trace!(key = ?key, "Call admitted"),
            Decision::Denied { .. } => debug!(key = ?key, "Rate limit exceeded"),
        }
        decision
    }

    /// Start a counter for `key` and register it, unless a concurrent caller
    /// registered one first.
    fn create_counter(&self, key: &K) -> Arc<DecayCounter> {
        // The decay process starts before the counter is visible to others.
        let mut pending = self.start_counter(key);
        loop {
            match self.register(key, pending) {
                Some(counter) => return counter,
                None => {
                    debug!(key = ?key, "Counter expired before registration, restarting");
                    pending = self.start_counter(key);
                }
            }
        }
    }

    fn start_counter(&self, key: &K) -> (Arc<DecayCounter>, DecayTask) {
        let weak = Arc::downgrade(&self.shared);
        let expired_key = key.clone();
        DecayCounter::start(
            self.shared.limits,
            &self.shared.runtime,
            self.shared.shutdown.subscribe(),
            self.shared.live.clone(),
            move || expire(weak, expired_key),
        )
    }

    /// Insert a started counter for `key`, or return the one already there.
    ///
    /// Returns `None` if ours already decayed to zero. Its expiry found no
    /// entry to remove, so inserting it would leave a key with no decay
    /// process. Expiry also takes the write lock, so a counter that expires
    /// after the check still removes its own entry.
    fn register(&self, key: &K, (counter, task): (Arc<DecayCounter>, DecayTask)) -> Option<Arc<DecayCounter>> {
        let mut counters = self.shared.counters.write();
        if let Some(winner) = counters.get(key) {
            let winner = winner.clone();
            drop(counters);

            debug!(key = ?key, "Counter created concurrently, discarding ours");
            task.abort();
            return Some(winner);
        }

        if counter.is_expired() {
            return None;
        }

        counters.insert(key.clone(), counter.clone());
        drop(counters);

        debug!(key = ?key, "Creating new rate limit counter");
        Some(counter)
    }

    /// Stop every decay process.
    ///
    /// Registered keys are left in place and will no longer decay; a limiter
    /// that has been shut down is meant to be discarded.
    pub fn shutdown(&self) {
        info!(keys = self.len(), "Shutting down rate limiter");
        self.shared.shutdown.send_replace(true);
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Get the normalized limits this limiter enforces.
    pub fn limits(&self) -> Limits {
        self.shared.limits
    }

    /// Get the consumed capacity for a key.
    ///
    /// Returns `None` if the key has no live counter.
    pub fn consumed(&self, key: &K) -> Option<i64> {
        self.shared.counters.read().get(key).map(|c| c.amount())
    }

    /// Whether `key` currently has a counter.
    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.counters.read().contains_key(key)
    }

    /// Get the number of keys with a counter.
    pub fn len(&self) -> usize {
        self.shared.counters.read().len()
    }

    /// Whether no key currently has a counter.
    pub fn is_empty(&self) -> bool {
        self.shared.counters.read().is_empty()
    }

    /// Get the number of decay processes still running.
    pub fn active_decays(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }
}

impl<K> Shared<K>
where
    K: Eq + Hash,
{
    /// Drop the entry for `key`. Idempotent.
    fn remove(&self, key: &K) {
        self.counters.write().remove(key);
    }
}

/// Called from a decay process once its counter has fully decayed.
fn expire<K>(shared: Weak<Shared<K>>, key: K)
where
    K: Eq + Hash + Debug,
{
    let Some(shared) = shared.upgrade() else {
        return;
    };

    shared.remove(&key);
    debug!(key = ?key, "Idle counter expired");
}
