//! Keyed Limiter - In-Process Per-Key Rate Limiting
//!
//! This crate admits up to a configured burst of calls per key and restores
//! one unit of capacity per period. Each active key owns a decay process on
//! the tokio runtime that expires the key once its usage has fully decayed,
//! so no external coordination or sweeping is needed.
//!
//! ```no_run
//! use std::time::Duration;
//! use keyed_limiter::RateLimiter;
//!
//! # async fn run() -> keyed_limiter::error::Result<()> {
//! let limiter = RateLimiter::new(3, Duration::from_millis(100))?;
//!
//! let decision = limiter.try_acquire(&"client-42");
//! if !decision.is_admitted() {
//!     println!("retry in {:?}", decision.retry_after());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::{LimiterConfig, Limits};
pub use ratelimit::{Decision, RateLimiter};
