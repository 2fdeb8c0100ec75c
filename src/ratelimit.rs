use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::KilnError;

/// Entries beyond this count trigger a sweep of expired windows on insert.
const EVICT_THRESHOLD: usize = 4096;

/// Outcome of one budget check.
///
/// `remaining <= limit` always holds, and `reset` stays fixed for the whole
/// window it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds at which the current window ends.
    pub reset: u64,
}

/// Post-increment state of one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_epoch_ms: u64,
}

/// Keyed counter backend shared by every concurrent request.
///
/// Implementations must make `increment` an atomic increment-and-read: two
/// concurrent calls for the same key never observe the same count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`. The first touch of a window (or the
    /// first touch after it expired) starts a new one ending at `now + window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, KilnError>;
}

pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-process counter store. Windows are evicted lazily once they expire.
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, WindowCount>>,
    clock: Clock,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(system_clock_ms))
    }

    /// Use a custom millisecond clock (for testing window expiry).
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of tracked windows, expired or not.
    pub fn len(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, KilnError> {
        let now = (self.clock)();
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| KilnError::Store("counter lock poisoned".to_string()))?;

        if !windows.contains_key(key) && windows.len() >= EVICT_THRESHOLD {
            windows.retain(|_, w| w.reset_epoch_ms > now);
        }

        let entry = windows.entry(key.to_string()).or_insert(WindowCount {
            count: 0,
            reset_epoch_ms: 0,
        });
        if entry.reset_epoch_ms <= now {
            entry.count = 0;
            entry.reset_epoch_ms = now.saturating_add(window.as_millis() as u64);
        }
        entry.count += 1;
        Ok(*entry)
    }
}

/// Identity-keyed fixed-window request budget.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()))
    }

    /// Count one request against `identity`'s budget.
    ///
    /// A store failure fails open: the request is allowed and the degraded
    /// mode is logged.
    pub async fn check(
        &self,
        identity: &str,
        max_requests: u64,
        window: Duration,
    ) -> RateLimitDecision {
        let key = format!("ratelimit:{identity}:{}", window.as_millis());
        match self.store.increment(&key, window).await {
            Ok(w) => RateLimitDecision {
                allowed: w.count <= max_requests,
                limit: max_requests,
                remaining: max_requests.saturating_sub(w.count),
                reset: w.reset_epoch_ms.div_ceil(1000),
            },
            Err(e) => {
                tracing::warn!(identity, error = %e, "rate limit store unavailable, failing open");
                RateLimitDecision {
                    allowed: true,
                    limit: max_requests,
                    remaining: max_requests,
                    reset: system_clock_ms().saturating_add(window.as_millis() as u64).div_ceil(1000),
                }
            }
        }
    }
}
