//! Sliding-window rate limiter for one external endpoint
//!
//! What this module provides
//! - `RateLimiter`: at most `max_requests` admissions per rolling `window`, and at
//!   least `min_delay` between two consecutive admissions
//! - `RateLimitLayer`: the same gate as Tower middleware
//!
//! Implementation strategy
//! - Admission history is a `VecDeque<Instant>` in admission order behind a std mutex
//!   that is never held across an await
//! - Waiters queue on a fair `tokio::sync::Mutex<()>`, so they are admitted in FIFO order
//! - The head waiter sleeps until the soonest instant a slot could open, capped at one
//!   second, then re-checks; `reset()` wakes it early
//!
//! The limiter is a cheap `Clone` handle. Construct one per endpoint and inject it
//! everywhere that endpoint is called; there is no global instance.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info_span, Instrument};

use crate::config::RateLimitConfig;
use crate::error::Result;

/// Longest a waiter sleeps before re-checking availability.
pub const MAX_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot returned by [`RateLimiter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub requests_in_window: usize,
    pub max_requests: usize,
    pub utilization_percent: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    config: RateLimitConfig,
    history: Mutex<History>,
    turn: tokio::sync::Mutex<()>,
    reset: Notify,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_parts(RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter, rejecting a zero `max_requests` or zero window.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config))
    }

    fn from_parts(config: RateLimitConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                history: Mutex::new(History {
                    admitted: VecDeque::with_capacity(config.max_requests.min(64)),
                    last: None,
                }),
                turn: tokio::sync::Mutex::new(()),
                reset: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }

    /// Wait for a slot, then run `operation` and return its result unchanged.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.acquire().await;
        operation().await
    }

    /// Wait until a slot is free and record the admission.
    pub async fn acquire(&self) {
        let _turn = self.shared.turn.lock().await;
        loop {
            let reset = self.shared.reset.notified();
            tokio::pin!(reset);
            reset.as_mut().enable();

            let now = Instant::now();
            let wait = {
                let mut history = self.history();
                let expired = history.first_in_window(now, self.shared.config.window);
                history.admitted.drain(..expired);
                let wait = history.wait_time(0, now, &self.shared.config);
                if wait.is_zero() {
                    history.admitted.push_back(now);
                    history.last = Some(now);
                    debug!(
                        in_window = history.admitted.len(),
                        "rate limiter admitted request"
                    );
                    return;
                }
                wait
            };

            debug!(?wait, "rate limiter waiting for slot");
            tokio::select! {
                _ = sleep(wait.min(MAX_RECHECK_INTERVAL)) => {}
                _ = &mut reset => {}
            }
        }
    }

    /// How long a caller arriving now would wait, ignoring queued callers.
    pub fn time_until_available(&self) -> Duration {
        let now = Instant::now();
        let history = self.history();
        let start = history.first_in_window(now, self.shared.config.window);
        history.wait_time(start, now, &self.shared.config)
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let history = self.history();
        let start = history.first_in_window(now, self.shared.config.window);
        let requests_in_window = history.admitted.len() - start;
        let max_requests = self.shared.config.max_requests;
        let utilization_percent = if max_requests == 0 {
            0
        } else {
            (requests_in_window as f64 / max_requests as f64 * 100.0).round() as u32
        };
        RateLimitStats {
            requests_in_window,
            max_requests,
            utilization_percent,
        }
    }

    /// Forget all admissions. Operations already admitted keep running.
    pub fn reset(&self) {
        {
            let mut history = self.history();
            history.admitted.clear();
            history.last = None;
        }
        self.shared.reset.notify_waiters();
        debug!("rate limiter reset");
    }

    fn history(&self) -> std::sync::MutexGuard<'_, History> {
        // The guarded section never panics, but a poisoned deque of instants is still valid.
        self.shared
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission instants in admission order, plus the most recent one.
///
/// `last` outlives pruning so the spacing rule holds even when
/// `min_delay` is longer than the window.
struct History {
    admitted: VecDeque<Instant>,
    last: Option<Instant>,
}

impl History {
    /// Index of the first admission still inside the window ending at `now`.
    fn first_in_window(&self, now: Instant, window: Duration) -> usize {
        self.admitted
            .iter()
            .position(|t| now.saturating_duration_since(*t) < window)
            .unwrap_or(self.admitted.len())
    }

    /// Wait until both the count and spacing rules allow an admission.
    ///
    /// Only `admitted[start..]` counts against the window.
    fn wait_time(&self, start: usize, now: Instant, config: &RateLimitConfig) -> Duration {
        let spacing = self
            .last
            .map(|last| (last + config.min_delay).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        let in_window = self.admitted.len() - start;
        let count = if in_window >= config.max_requests {
            let opening = self.admitted[self.admitted.len() - config.max_requests];
            (opening + config.window).saturating_duration_since(now)
        } else {
            Duration::ZERO
        };

        spacing.max(count)
    }
}

// ===== Tower layer =====

/// Gates every call of the inner service through a shared [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

pub struct RateLimited<S> {
    inner: Arc<tokio::sync::Mutex<S>>,
    limiter: RateLimiter,
}

impl<S> Clone for RateLimited<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimited<S>;
    fn layer(&self, inner: S) -> Self::Service {
        RateLimited {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            limiter: self.limiter.clone(),
        }
    }
}

impl<S, Req> Service<Req> for RateLimited<S>
where
    Req: Send + 'static,
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
        let limiter = self.limiter.clone();
        let inner = self.inner.clone();
        let span = info_span!("rate_limited", max_requests = limiter.config().max_requests);
        Box::pin(
            async move {
                limiter
                    .execute(|| async move {
                        let fut = {
                            let mut guard = inner.lock().await;
                            ServiceExt::ready(&mut *guard).await?.call(req)
                        };
                        fut.await
                    })
                    .await
            }
            .instrument(span),
        )
    }
}
