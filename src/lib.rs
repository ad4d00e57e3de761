//! # Wardrobe Resilience
//!
//! Client-side reliability utilities for the wardrobe stylist app: the pieces
//! that sit between a UI action ("delete item", "save rating", "analyze photo")
//! and the backend or AI endpoint it talks to.
//!
//! ## Core Concepts
//!
//! - **OptimisticUpdater**: mutate local state now, await the remote call, roll back on failure
//! - **RateLimiter**: sliding-window + minimum-spacing gate shared by every caller of one endpoint
//! - **Retry**: exponential backoff with jitter, for transient (rate limit, quota) failures only
//! - **Layers**: the limiter and retry as Tower middleware for service-based clients
//!
//! All three are independent; compose them as needed. [`ResilientEndpoint`]
//! is the usual composition for an AI endpoint.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use wardrobe_resilience::{
//!     config, Error, OptimisticList, ResilientEndpoint, UpdateCallbacks,
//! };
//!
//! # async fn example() -> Result<(), Error> {
//! let cfg = config::from_env();
//! let gemini = ResilientEndpoint::from_config("gemini", &cfg)?;
//!
//! let tags = gemini
//!     .call(|| async { Ok::<_, Error>(vec!["denim", "casual"]) })
//!     .await?;
//!
//! let wardrobe = OptimisticList::from(vec!["coat", "scarf"]);
//! wardrobe
//!     .remove_where(
//!         |item| *item == "scarf",
//!         || async { Err::<(), _>(Error::permanent("delete failed")) },
//!         UpdateCallbacks::new().on_error(|e: &Error| eprintln!("toast: {}", e)),
//!     )
//!     .await
//!     .ok();
//! # let _ = tags;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod optimistic;
pub mod rate_limit;
pub mod retry;
pub mod telemetry;

pub use config::{RateLimitConfig, ResilienceConfig, RetryConfig};
pub use endpoint::ResilientEndpoint;
pub use error::{Error, Result};
pub use optimistic::{
    update, Mutate, OptimisticList, OptimisticUpdater, RemoteCall, Rollback, UpdateCallbacks,
};
pub use rate_limit::{RateLimitLayer, RateLimitStats, RateLimited, RateLimiter};
pub use retry::{retry_with_backoff, Retry, RetryBuilder, RetryLayer, RetryPolicy};

// Re-export Tower traits that users need
pub use tower::{BoxError, Layer, Service, ServiceExt};
