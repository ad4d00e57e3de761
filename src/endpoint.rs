//! One external endpoint: throttled by a shared limiter, retried on transient failures
//!
//! Each retry attempt goes back through the limiter, so retries spend the same
//! admission budget as first attempts.

use std::future::Future;

use tracing::{info_span, Instrument};

use crate::config::ResilienceConfig;
use crate::error::Result;
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ResilientEndpoint {
    name: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl ResilientEndpoint {
    pub fn new(name: impl Into<String>, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            limiter,
            retry,
        }
    }

    /// Build an endpoint with its own limiter.
    pub fn from_config(name: impl Into<String>, config: &ResilienceConfig) -> Result<Self> {
        Ok(Self::new(
            name,
            RateLimiter::new(config.rate_limit)?,
            RetryPolicy::new(config.retry),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn stats(&self) -> RateLimitStats {
        self.limiter.stats()
    }

    /// Run `operation` with throttling and retry.
    ///
    /// `operation` is called only after the limiter admits the attempt.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!("endpoint", name = %self.name);
        self.retry
            .run_gated(|| self.limiter.acquire(), operation)
            .instrument(span)
            .await
    }
}
