//! Configuration management for the keyed limiter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Shortest decay period a limiter will run with.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Longest decay period; keeps decay instants within `Instant` range.
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 3600);

/// Limiter configuration as supplied by the caller.
///
/// Out-of-range values are clamped rather than rejected, except for a burst
/// that does not fit in an `i32`, which is a fatal configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Calls admitted per key before the key is exhausted
    #[serde(default = "default_max_burst")]
    pub max_burst: u64,

    /// Interval in milliseconds at which one unit of burst is restored
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_burst: default_max_burst(),
            period_ms: default_period_ms(),
        }
    }
}

fn default_max_burst() -> u64 {
    10
}

fn default_period_ms() -> u64 {
    1000
}

/// Normalized, immutable limits shared by a registry and all of its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum resting value of a key's consumed capacity
    pub max_burst: i32,
    /// Time between two decay ticks
    pub period: Duration,
}

impl LimiterConfig {
    /// Create a configuration from a burst size and a decay period.
    pub fn new(max_burst: u64, period: Duration) -> Self {
        Self {
            max_burst,
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))?;

        info!(
            max_burst = config.max_burst,
            period_ms = config.period_ms,
            "Limiter configuration loaded"
        );
        Ok(config)
    }

    /// Validate and clamp this configuration into [`Limits`].
    pub fn limits(&self) -> Result<Limits> {
        let max_burst = self.max_burst.max(1);
        let max_burst = i32::try_from(max_burst).map_err(|_| {
            LimiterError::Config(format!(
                "max_burst {} exceeds the supported maximum of {}",
                self.max_burst,
                i32::MAX
            ))
        })?;

        let period = Duration::from_millis(self.period_ms).clamp(MIN_PERIOD, MAX_PERIOD);

        Ok(Limits { max_burst, period })
    }
}
