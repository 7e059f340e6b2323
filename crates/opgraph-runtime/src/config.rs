//! Engine configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Execution queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, used in logs.
    pub name: String,

    /// Maximum number of units executing at once.
    pub max_concurrent: usize,

    /// Warn when a unit is still executing this long after its body returned.
    /// Such a body most likely forgot to call finish.
    pub finish_watchdog: Option<Duration>,

    /// Start with execution held back until `resume()`.
    pub start_suspended: bool,
}

impl QueueConfig {
    /// Default configuration with a specific name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_finish_watchdog(mut self, watchdog: Duration) -> Self {
        self.finish_watchdog = Some(watchdog);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.start_suspended = true;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            finish_watchdog: Some(Duration::from_secs(60)),
            start_suspended: false,
        }
    }
}

/// Scheduled task coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time between ticks.
    pub interval: Duration,
}

impl CoordinatorConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert!(config.max_concurrent >= 1);
        assert!(!config.start_suspended);
        assert_eq!(config.finish_watchdog, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_max_concurrent_floor() {
        let config = QueueConfig::named("q").with_max_concurrent(0);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.name, "q");
    }

    #[test]
    fn test_coordinator_default_interval() {
        assert_eq!(CoordinatorConfig::default().interval, Duration::from_secs(10));
    }
}
