//! In-process fixed-window admission.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::AdmissionAlgorithm;
use crate::clock::Clock;
use crate::error::Result;

/// Counting state for one partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests seen in the current window, including rejected ones
    pub count: u64,
    /// Epoch second the current window opened
    pub window_start: i64,
    /// Length of the current window
    pub window_seconds: u64,
}

impl WindowState {
    fn open(now: i64, window_seconds: u64) -> Self {
        Self {
            count: 1,
            window_start: now,
            window_seconds,
        }
    }

    fn window_end(&self) -> i64 {
        let length = i64::try_from(self.window_seconds).unwrap_or(i64::MAX);
        self.window_start.saturating_add(length)
    }

    /// The end second itself still belongs to the window.
    fn is_expired(&self, now: i64) -> bool {
        now > self.window_end()
    }
}

/// Fixed-window counter keyed by partition key.
///
/// Each key's window opens on its first request and lasts `window_seconds`;
/// the count resets entirely when it closes, so bursts straddling a boundary
/// can admit up to twice the limit. Updates for one key are serialized by the
/// map's shard lock; other keys are unaffected.
pub struct LocalWindowLimiter {
    windows: DashMap<String, WindowState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LocalWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWindowLimiter")
            .field("windows", &self.windows.len())
            .finish()
    }
}

impl LocalWindowLimiter {
    /// Create a new limiter reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Count a request against `key`. Opening a window always admits, even
    /// with a zero limit.
    pub fn check(&self, key: &str, limit: u64, window_seconds: u64) -> bool {
        let now = self.clock.now_secs();
        match self.windows.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                trace!(key = %key, limit = limit, window = window_seconds, "Opening first window");
                vacant.insert(WindowState::open(now, window_seconds));
                true
            }
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if state.is_expired(now) {
                    trace!(key = %key, limit = limit, window = window_seconds, "Opening new window");
                    *state = WindowState::open(now, window_seconds);
                    return true;
                }

                state.count = state.count.saturating_add(1);
                let admitted = state.count <= limit;
                if !admitted {
                    debug!(key = %key, count = state.count, limit = limit, "Window limit exceeded");
                }
                admitted
            }
        }
    }

    /// Seconds until the window for `key` closes.
    pub fn remaining_seconds(&self, key: &str) -> u64 {
        let now = self.clock.now_secs();
        self.windows
            .get(key)
            .map(|state| state.window_end().saturating_sub(now).max(0) as u64)
            .unwrap_or(0)
    }

    /// Snapshot of the state for `key`.
    pub fn state(&self, key: &str) -> Option<WindowState> {
        self.windows.get(key).map(|s| *s)
    }

    /// Drop windows that have closed. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.windows.len();
        self.windows.retain(|_, state| !state.is_expired(now));
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted expired windows");
        }
        evicted
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval` until the
    /// limiter is dropped.
    pub fn spawn_eviction_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(limiter) => {
                        limiter.evict_expired();
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of tracked keys.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Clear all windows.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[async_trait]
impl AdmissionAlgorithm for LocalWindowLimiter {
    async fn allow(&self, key: &str, limit: u64, window_seconds: u64) -> Result<bool> {
        Ok(self.check(key, limit, window_seconds))
    }

    async fn wait_time_seconds(&self, key: &str) -> u64 {
        self.remaining_seconds(key)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
