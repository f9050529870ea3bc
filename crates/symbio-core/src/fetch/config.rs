use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fetcher politeness and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Minimum delay between two requests of one worker, in milliseconds
    pub min_delay_ms: u64,
    /// Connection timeout in seconds
    pub connect_timeout_seconds: u32,
    /// Whole-request timeout in seconds
    pub request_timeout_seconds: u32,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First backoff wait, in milliseconds
    pub backoff_base_ms: u64,
    /// Growth of the backoff wait per retry; must exceed 1
    pub backoff_factor: f64,
    /// Consecutive failures before the user agent is rotated
    pub rotate_after_failures: u32,
    /// Concurrent fetch workers
    pub workers: usize,
    /// Pending jobs buffered ahead of the workers
    pub queue_capacity: usize,
    /// User agents to rotate through (built-in list when empty)
    pub user_agents: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            connect_timeout_seconds: 10,
            request_timeout_seconds: 30,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_factor: 2.0,
            rotate_after_failures: 3,
            workers: 4,
            queue_capacity: 64,
            user_agents: vec![],
        }
    }
}

impl FetchConfig {
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_seconds))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.request_timeout_seconds))
    }

    /// Wait before retry number `retry` (zero-based): `base * factor^retry`.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let millis = self.backoff_base_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), FetchConfigError> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor > 1.0) {
            return Err(FetchConfigError::NonIncreasingBackoff(self.backoff_factor));
        }
        if self.backoff_base_ms == 0 {
            return Err(FetchConfigError::ZeroBackoffBase);
        }
        if self.workers == 0 {
            return Err(FetchConfigError::NoWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(FetchConfigError::NoQueueCapacity);
        }
        if self.request_timeout_seconds == 0 {
            return Err(FetchConfigError::NoTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchConfigError {
    #[error("Backoff factor must be greater than 1, got {0}")]
    NonIncreasingBackoff(f64),
    #[error("Backoff base must be positive")]
    ZeroBackoffBase,
    #[error("At least one fetch worker is required")]
    NoWorkers,
    #[error("Fetch queue capacity must be positive")]
    NoQueueCapacity,
    #[error("Network calls require a request timeout")]
    NoTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FetchConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.min_delay(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_strictly_increases() {
        let config = FetchConfig::default();

        let waits: Vec<Duration> = (0..5).map(|r| config.backoff_delay(r)).collect();

        assert_eq!(waits[0], Duration::from_secs(1));
        assert_eq!(waits[3], Duration::from_secs(8));
        assert!(waits.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_validate_rejects_flat_backoff() {
        let config = FetchConfig {
            backoff_factor: 1.0,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(FetchConfigError::NonIncreasingBackoff(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = FetchConfig {
            workers: 0,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(FetchConfigError::NoWorkers)));
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: FetchConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.workers, 4);
    }
}
