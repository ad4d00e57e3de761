//! Retry with exponential backoff and jitter
//!
//! Only transient failures (rate limit, quota) are retried. Everything else is
//! returned on the first attempt without added latency.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{classify_boxed, Error, Result};

/// Retry policy for operations
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }

    /// `base_delay * 2^attempt + jitter`, saturating on overflow.
    pub fn delay_for_attempt(&self, attempt: usize, jitter: Duration) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|a| 1u32.checked_shl(a))
            .unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(factor)
            .saturating_add(jitter)
    }

    /// Uniform jitter in `[0, max_jitter)`.
    fn sample_jitter(&self) -> Duration {
        let max_ms = self.config.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    /// Run `operation` under this policy.
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_gated(|| std::future::ready(()), operation).await
    }

    /// Like [`run`](Self::run), but awaits `gate` before every attempt.
    ///
    /// `operation` is only called once the gate resolves, so nothing in its
    /// body runs ahead of the gate.
    pub async fn run_gated<G, GFut, F, Fut, T>(&self, gate: G, operation: F) -> Result<T>
    where
        G: FnMut() -> GFut,
        GFut: Future<Output = ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_retries;
        self.run_classified(gate, operation, Error::is_transient, move |last| {
            Error::RetryExhausted {
                attempts,
                source: Box::new(last),
            }
        })
        .await
    }

    async fn run_classified<G, GFut, F, Fut, T, E, C, X>(
        &self,
        mut gate: G,
        mut operation: F,
        is_transient: C,
        exhausted: X,
    ) -> std::result::Result<T, E>
    where
        G: FnMut() -> GFut,
        GFut: Future<Output = ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
        C: Fn(&E) -> bool,
        X: FnOnce(E) -> E,
    {
        let max_retries = self.config.max_retries;
        let mut attempt = 0;
        loop {
            gate().await;
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !is_transient(&error) {
                        debug!("Non-retryable error: {}", error);
                        return Err(error);
                    }

                    if attempt >= max_retries {
                        warn!(
                            "Max retries ({}) exceeded. Last error: {}",
                            max_retries, error
                        );
                        return Err(exhausted(error));
                    }

                    let delay = self.delay_for_attempt(attempt, self.sample_jitter());
                    attempt += 1;
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, error, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Retry `operation` up to `max_retries` extra times, doubling from `base_delay`.
///
/// Jitter is drawn uniformly from `[0, 1s)` per attempt.
pub async fn retry_with_backoff<F, Fut, T>(
    operation: F,
    max_retries: usize,
    base_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::new(RetryConfig {
        max_retries,
        base_delay,
        ..RetryConfig::default()
    })
    .run(operation)
    .await
}

/// Builder for retry operations
pub struct RetryBuilder {
    config: RetryConfig,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_retries(mut self, max: usize) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_jitter(mut self, jitter: Duration) -> Self {
        self.config.max_jitter = jitter;
        self
    }

    pub fn policy(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }

    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.policy().run(operation).await
    }
}

// ===== Tower layer =====

/// Retries an inner service on transient errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

pub struct Retry<S> {
    inner: Arc<Mutex<S>>,
    policy: RetryPolicy,
}

impl<S> Clone for Retry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy,
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            policy: self.policy,
        }
    }
}

impl<S, Req> Service<Req> for Retry<S>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let policy = self.policy;
        let inner = self.inner.clone();
        Box::pin(async move {
            let attempts = policy.max_retries();
            policy
                .run_classified(
                    || std::future::ready(()),
                    move || {
                        let inner = inner.clone();
                        let req = req.clone();
                        async move {
                            let mut guard = inner.lock().await;
                            ServiceExt::ready(&mut *guard).await?.call(req).await
                        }
                    },
                    classify_boxed,
                    move |last: BoxError| {
                        let source = match last.downcast::<Error>() {
                            Ok(err) => err,
                            Err(other) => Box::new(Error::transient(other.to_string(), None)),
                        };
                        Box::new(Error::RetryExhausted { attempts, source }) as BoxError
                    },
                )
                .await
        })
    }
}
