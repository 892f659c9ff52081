//! Rate limiting logic and per-key state management.

mod counter;
mod decision;
mod limiter;

pub use decision::Decision;
pub use limiter::RateLimiter;
