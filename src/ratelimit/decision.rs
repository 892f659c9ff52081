//! Admission decision returned by the limiter.

use std::time::Duration;
use tokio::time::Instant;

/// The outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed.
    Admitted,
    /// The key's burst is exhausted.
    ///
    /// `retry_at` is the next instant at which one unit of capacity is
    /// restored. It is advisory: another caller may take that unit first.
    Denied {
        /// Earliest instant at which capacity is expected to be available
        retry_at: Instant,
    },
}

impl Decision {
    /// Returns `true` if the call was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    /// The retry instant of a denial, `None` when admitted.
    pub fn retry_at(&self) -> Option<Instant> {
        match self {
            Decision::Admitted => None,
            Decision::Denied { retry_at } => Some(*retry_at),
        }
    }

    /// Time left until `retry_at`, zero when admitted or already elapsed.
    pub fn retry_after(&self) -> Duration {
        self.retry_at()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}
