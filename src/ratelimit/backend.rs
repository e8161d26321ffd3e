//! Admission algorithm trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use crate::error::Result;

/// Trait for admission algorithm implementations.
///
/// This trait abstracts over the in-process [`LocalWindowLimiter`] and the
/// store-backed [`DistributedLimiter`] so the admission coordinator works with
/// either.
///
/// [`LocalWindowLimiter`]: super::LocalWindowLimiter
/// [`DistributedLimiter`]: super::DistributedLimiter
#[async_trait]
pub trait AdmissionAlgorithm: Send + Sync {
    /// Consume one unit of the budget for `key`, returning whether the request
    /// is admitted.
    async fn allow(&self, key: &str, limit: u64, window_seconds: u64) -> Result<bool>;

    /// Seconds until the budget for `key` is replenished, or 0 when unknown.
    async fn wait_time_seconds(&self, key: &str) -> u64;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
