//! Per-address abuse tracking and temporary bans.
//!
//! Each source address has a request counter that a background task hard-resets
//! to zero every `count_reset_interval_seconds`. An address whose count exceeds
//! the threshold within one interval is banned for `ban_duration_seconds`.
//! Expired bans are removed lazily by the next check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DdosConfig;

/// Abuse tracker for source addresses.
pub struct DdosGuard {
    counts: DashMap<String, u64>,
    /// Ban expiry per address, in epoch seconds
    bans: DashMap<String, i64>,
    threshold: AtomicU64,
    ban_duration_seconds: AtomicU64,
    reset_interval_seconds: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DdosGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdosGuard")
            .field("threshold", &self.threshold())
            .field("ban_duration_seconds", &self.ban_duration_seconds())
            .field("reset_interval_seconds", &self.reset_interval_seconds())
            .field("tracked", &self.counts.len())
            .field("banned", &self.bans.len())
            .finish()
    }
}

impl DdosGuard {
    /// Create a guard from configuration.
    pub fn new(config: &DdosConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            counts: DashMap::new(),
            bans: DashMap::new(),
            threshold: AtomicU64::new(config.threshold),
            ban_duration_seconds: AtomicU64::new(config.ban_duration_seconds),
            reset_interval_seconds: AtomicU64::new(config.count_reset_interval_seconds.max(1)),
            clock,
        }
    }

    /// Whether `address` is currently banned. Removes an expired ban.
    pub fn is_banned(&self, address: &str) -> bool {
        let now = self.clock.now_secs();
        if self
            .bans
            .remove_if(address, |_, expires_at| *expires_at <= now)
            .is_some()
        {
            debug!(address = %address, "Ban expired");
            return false;
        }
        self.bans.contains_key(address)
    }

    /// Count a request from `address`. Returns `false` if the address is, or
    /// has just become, banned.
    pub fn track_request(&self, address: &str) -> bool {
        if self.is_banned(address) {
            debug!(address = %address, "Request from banned address");
            return false;
        }

        let count = {
            let mut entry = self.counts.entry(address.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count > self.threshold() {
            warn!(
                address = %address,
                count = count,
                threshold = self.threshold(),
                "Possible DDoS attack detected"
            );
            self.ban_ip(address, self.ban_duration_seconds());
            return false;
        }

        true
    }

    /// Ban `address` for `duration_seconds`, replacing any existing ban.
    pub fn ban_ip(&self, address: &str, duration_seconds: u64) {
        let expires_at = self
            .clock
            .now_secs()
            .saturating_add(i64::try_from(duration_seconds).unwrap_or(i64::MAX));
        self.bans.insert(address.to_string(), expires_at);
        info!(address = %address, expires_at = expires_at, "Banned address");
    }

    /// Lift a ban early. Returns whether one existed.
    pub fn unban_ip(&self, address: &str) -> bool {
        self.bans.remove(address).is_some()
    }

    /// Current request count for `address` in this interval.
    pub fn request_count(&self, address: &str) -> u64 {
        self.counts.get(address).map(|c| *c).unwrap_or(0)
    }

    /// Clear every request counter.
    pub fn reset_counts(&self) {
        let tracked = self.counts.len();
        self.counts.clear();
        debug!(tracked = tracked, "Reset DDoS request counters");
    }

    /// Reset counters every `count_reset_interval_seconds` until the guard is
    /// dropped. The interval is re-read each period.
    pub fn spawn_reset_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(guard) => guard.reset_interval_seconds(),
                    None => break,
                };
                tokio::time::sleep(Duration::from_secs(interval)).await;
                match weak.upgrade() {
                    Some(guard) => guard.reset_counts(),
                    None => break,
                }
            }
        })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn set_threshold(&self, threshold: u64) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn ban_duration_seconds(&self) -> u64 {
        self.ban_duration_seconds.load(Ordering::Relaxed)
    }

    /// Applies to bans created from now on.
    pub fn set_ban_duration_seconds(&self, seconds: u64) {
        self.ban_duration_seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn reset_interval_seconds(&self) -> u64 {
        self.reset_interval_seconds.load(Ordering::Relaxed)
    }

    /// Takes effect after the current period elapses.
    pub fn set_reset_interval_seconds(&self, seconds: u64) {
        self.reset_interval_seconds
            .store(seconds.max(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn guard(threshold: u64, ban: u64) -> (DdosGuard, MockClock) {
        let clock = MockClock::at_epoch_secs(1_700_000_000);
        let config = DdosConfig {
            threshold,
            ban_duration_seconds: ban,
            count_reset_interval_seconds: 60,
        };
        (DdosGuard::new(&config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_ban_after_threshold() {
        let (guard, clock) = guard(100, 300);

        for i in 1..=100 {
            assert!(guard.track_request("1.2.3.4"), "request {} should pass", i);
        }
        assert!(!guard.is_banned("1.2.3.4"));

        assert!(!guard.track_request("1.2.3.4"));
        assert!(guard.is_banned("1.2.3.4"));

        clock.advance_secs(299);
        assert!(guard.is_banned("1.2.3.4"));
        clock.advance_secs(2);
        assert!(!guard.is_banned("1.2.3.4"));
    }

    #[test]
    fn test_banned_requests_are_not_counted() {
        let (guard, _clock) = guard(2, 60);

        for _ in 0..3 {
            guard.track_request("a");
        }
        assert_eq!(guard.request_count("a"), 3);
        assert!(!guard.track_request("a"));
        assert_eq!(guard.request_count("a"), 3);
    }

    #[test]
    fn test_reset_counts() {
        let (guard, _clock) = guard(2, 60);

        guard.track_request("a");
        guard.track_request("a");
        guard.reset_counts();
        assert_eq!(guard.request_count("a"), 0);
        assert!(guard.track_request("a"));
        assert!(guard.track_request("a"));
    }

    #[test]
    fn test_addresses_tracked_separately() {
        let (guard, _clock) = guard(1, 60);

        assert!(guard.track_request("a"));
        assert!(!guard.track_request("a"));
        assert!(guard.track_request("b"));
    }

    #[test]
    fn test_runtime_settings() {
        let (guard, clock) = guard(1000, 60);

        guard.set_threshold(1);
        guard.set_ban_duration_seconds(10);
        assert!(guard.track_request("a"));
        assert!(!guard.track_request("a"));
        clock.advance_secs(10);
        assert!(!guard.is_banned("a"));

        guard.set_reset_interval_seconds(0);
        assert_eq!(guard.reset_interval_seconds(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tracking_admits_exactly_threshold() {
        let (guard, _clock) = guard(20, 300);
        let guard = Arc::new(guard);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let guard = guard.clone();
                tokio::spawn(async move { guard.track_request("10.1.1.1") })
            })
            .collect();

        let passed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(passed, 20);
        assert!(guard.is_banned("10.1.1.1"));
    }

    #[test]
    fn test_huge_ban_duration_does_not_wrap() {
        let (guard, clock) = guard(100, 300);

        guard.ban_ip("1.2.3.4", u64::MAX);
        clock.advance_secs(10_000_000);
        assert!(guard.is_banned("1.2.3.4"));
    }

    #[test]
    fn test_manual_ban_and_unban() {
        let (guard, _clock) = guard(1000, 60);

        guard.ban_ip("9.9.9.9", 30);
        assert!(guard.is_banned("9.9.9.9"));
        assert!(!guard.track_request("9.9.9.9"));
        assert!(guard.unban_ip("9.9.9.9"));
        assert!(guard.track_request("9.9.9.9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_task_clears_counts() {
        let (guard, _clock) = guard(1000, 60);
        let guard = Arc::new(guard);
        let handle = guard.spawn_reset_task();

        guard.track_request("a");
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(guard.request_count("a"), 0);

        drop(guard);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }
}
