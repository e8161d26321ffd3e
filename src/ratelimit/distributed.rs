//! Distributed admission backed by a shared store.
//!
//! Every node delegates the check-and-consume step to one atomic operation on
//! the [`AtomicStore`], so nodes agree on the budget without coordinating with
//! each other. Clock skew between nodes is not compensated.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::AdmissionAlgorithm;
use super::store::AtomicStore;
use crate::clock::Clock;
use crate::error::Result;

/// Token-bucket admission delegated to a shared store.
pub struct DistributedLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DistributedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLimiter")
            .field("store", &self.store.name())
            .finish()
    }
}

impl DistributedLimiter {
    /// Create a new distributed limiter.
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }
}

#[async_trait]
impl AdmissionAlgorithm for DistributedLimiter {
    /// Store failures propagate; the caller picks fail-open or fail-closed.
    async fn allow(&self, key: &str, limit: u64, window_seconds: u64) -> Result<bool> {
        let now = self.clock.now_secs();

        trace!(
            key = %key,
            limit = limit,
            window = window_seconds,
            store = self.store.name(),
            "Checking distributed rate limit"
        );

        let admitted = self.store.consume(key, limit, window_seconds, now).await?;
        if !admitted {
            debug!(key = %key, limit = limit, "Distributed rate limit exceeded");
        }
        Ok(admitted)
    }

    /// Lookup failures are logged and reported as no wait.
    async fn wait_time_seconds(&self, key: &str) -> u64 {
        match self.store.ttl_seconds(key).await {
            Ok(ttl) => ttl.unwrap_or(0),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read remaining window from store");
                0
            }
        }
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::WardenError;
    use crate::ratelimit::store::InMemoryStore;

    struct BrokenStore;

    #[async_trait]
    impl AtomicStore for BrokenStore {
        async fn consume(&self, _: &str, _: u64, _: u64, _: i64) -> Result<bool> {
            Err(WardenError::Store(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }

        async fn ttl_seconds(&self, _: &str) -> Result<Option<u64>> {
            Err(WardenError::Store(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn limiter() -> (DistributedLimiter, MockClock) {
        let clock = MockClock::at_epoch_secs(1_700_000_000);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStore::new(shared.clone()));
        (DistributedLimiter::new(store, shared), clock)
    }

    #[tokio::test]
    async fn test_admits_limit_then_rejects() {
        let (limiter, _clock) = limiter();

        for i in 1..=5 {
            assert!(limiter.allow("k", 5, 60).await.unwrap(), "request {} should be OK", i);
        }
        assert!(!limiter.allow("k", 5, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_time_is_remaining_ttl() {
        let (limiter, clock) = limiter();

        assert_eq!(limiter.wait_time_seconds("k").await, 0);
        limiter.allow("k", 1, 60).await.unwrap();
        clock.advance_secs(15);
        assert_eq!(limiter.wait_time_seconds("k").await, 45);
    }

    #[tokio::test]
    async fn test_refills_after_expiry() {
        let (limiter, clock) = limiter();

        assert!(limiter.allow("k", 1, 10).await.unwrap());
        assert!(!limiter.allow("k", 1, 10).await.unwrap());
        clock.advance_secs(10);
        assert!(limiter.allow("k", 1, 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_propagates_from_allow() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at_epoch_secs(0));
        let limiter = DistributedLimiter::new(Arc::new(BrokenStore), clock);

        assert!(limiter.allow("k", 1, 10).await.is_err());
        assert_eq!(limiter.wait_time_seconds("k").await, 0);
    }
}
