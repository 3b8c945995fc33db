use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// One sliding-window admission attempt, as sent to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    /// Fully qualified store key.
    pub key: String,
    pub window_millis: u64,
    pub threshold: u64,
    /// Caller-supplied timestamp. `None` means the store uses its own clock, which keeps
    /// clock skew between callers out of the decision.
    pub now_millis: Option<u64>,
    /// Disambiguates events recorded within the same millisecond.
    pub nonce: u64,
}

/// Abstract storage interface for sliding-window state.
///
/// Implementations must execute prune, count and conditional record as ONE atomic
/// operation. Splitting them lets concurrent callers all observe "not yet full" and all
/// record, overshooting the threshold.
#[async_trait]
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    /// Drop events for `request.key` older than the window, count what remains, and if
    /// the count is below the threshold record one event and return `true`.
    async fn record_if_below(&self, request: &WindowRequest) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> WindowStore for Arc<S>
where
    S: WindowStore + ?Sized,
{
    async fn record_if_below(&self, request: &WindowRequest) -> Result<bool, StoreError> {
        (**self).record_if_below(request).await
    }
}

#[derive(Debug, Default)]
struct KeyEvents {
    window_millis: u64,
    // Timestamps, oldest first.
    events: VecDeque<u64>,
}

impl KeyEvents {
    fn prune(&mut self, now: u64) {
        while let Some(&oldest) = self.events.front() {
            if oldest.saturating_add(self.window_millis) <= now {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn expired(&self, now: u64) -> bool {
        match self.events.back() {
            Some(&newest) => newest.saturating_add(self.window_millis) <= now,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Keys {
    events: HashMap<String, KeyEvents>,
    last_sweep: Option<u64>,
}

impl Keys {
    fn sweep(&mut self, now: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|_, events| !events.expired(now));
        self.last_sweep = Some(now);
        before - self.events.len()
    }

    // At most one full pass per window, so each call pays an amortized O(1).
    fn sweep_if_due(&mut self, now: u64, window_millis: u64) {
        let last = *self.last_sweep.get_or_insert(now);
        if now.saturating_sub(last) >= window_millis {
            let dropped = self.sweep(now);
            if dropped > 0 {
                tracing::trace!(dropped, remaining = self.events.len(), "evicted idle window keys");
            }
        }
    }
}

/// Single-process window store. Every call runs under one mutex, which gives the same
/// atomicity the Redis script gets from the server.
///
/// Keys idle for a whole window are evicted by later calls, mirroring the key TTL the
/// Redis store sets.
#[derive(Clone, Debug)]
pub struct MemoryWindowStore {
    data: Arc<Mutex<Keys>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self { data: Arc::default(), clock: Arc::new(SystemClock) }
    }

    /// The store's own clock, used when a request carries no timestamp.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events currently recorded for `key`, expired ones included until the next prune.
    pub fn recorded(&self, key: &str) -> usize {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.events.get(key).map_or(0, |k| k.events.len())
    }

    /// Forget keys whose newest event has left its window right away, without waiting
    /// for the next sweep. Returns how many keys were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.data.lock().unwrap_or_else(PoisonError::into_inner).sweep(now)
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record_if_below(&self, request: &WindowRequest) -> Result<bool, StoreError> {
        let now = request.now_millis.unwrap_or_else(|| self.clock.now_millis());
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.sweep_if_due(now, request.window_millis);
        let entry = guard.events.entry(request.key.clone()).or_default();
        entry.window_millis = request.window_millis;
        entry.prune(now);

        if (entry.events.len() as u64) < request.threshold {
            entry.events.push_back(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
