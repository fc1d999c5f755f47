//! Request throttling for storage backends
//!
//! Fan-out across rows can easily exceed a backend's request rate limit.
//! [`Throttled`] wraps any [`BlobStore`] and waits on a Governor token
//! bucket before every backend call.

use super::{BlobStore, ObjectUri, RangeExporter, SourceInspector};
use crate::error::Result;
use async_trait::async_trait;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Token bucket limiting backend requests per second
#[derive(Clone)]
pub struct RequestLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RequestLimiter {
    /// Create a limiter allowing `requests_per_second` calls (minimum 1)
    pub fn new(requests_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Wait until one request may be issued
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to take one request slot without waiting
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// A store whose every call is rate limited
pub struct Throttled<S> {
    inner: S,
    limiter: RequestLimiter,
}

impl<S: BlobStore> Throttled<S> {
    /// Wrap `inner` with a limit of `requests_per_second`
    pub fn new(inner: S, requests_per_second: u32) -> Self {
        Self {
            inner,
            limiter: RequestLimiter::new(requests_per_second),
        }
    }

    /// Access the wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: BlobStore> SourceInspector for Throttled<S> {
    async fn exists(&self, source: &ObjectUri) -> Result<bool> {
        self.limiter.wait().await;
        self.inner.exists(source).await
    }

    async fn size(&self, source: &ObjectUri) -> Result<u64> {
        self.limiter.wait().await;
        self.inner.size(source).await
    }
}

#[async_trait]
impl<S: BlobStore> RangeExporter for Throttled<S> {
    async fn export_range(
        &self,
        source: &ObjectUri,
        target: &ObjectUri,
        start: u64,
        length: u64,
    ) -> Result<()> {
        self.limiter.wait().await;
        self.inner.export_range(source, target, start, length).await
    }
}

impl<S: BlobStore> BlobStore for Throttled<S> {
    fn scheme(&self) -> &str {
        self.inner.scheme()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn test_limiter_initial_capacity() {
        let limiter = RequestLimiter::new(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let limiter = RequestLimiter::new(0);
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_throttled_delegates() {
        let store = MemoryBlobStore::new();
        let source = ObjectUri::parse("mem://in/a.log").unwrap();
        store.put(&source, b"hello".to_vec());

        let throttled = Throttled::new(store, 1000);
        assert!(throttled.exists(&source).await.unwrap());
        assert_eq!(throttled.size(&source).await.unwrap(), 5);
        assert_eq!(throttled.scheme(), "mem");
    }
}
