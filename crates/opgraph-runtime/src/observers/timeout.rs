use std::time::Duration;

use tracing::warn;

use opgraph_core::OpError;

use super::Observer;
use crate::unit::TaskUnit;

/// Cancels a unit with `TimedOut` if it is still running `timeout` after it started.
///
/// Cancellation is cooperative: the body still has to notice and finish.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutObserver {
    timeout: Duration,
}

impl TimeoutObserver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Observer for TimeoutObserver {
    fn did_start(&self, unit: &TaskUnit) {
        let unit = unit.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = unit.finished() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        unit = %unit.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Unit timed out; cancelling"
                    );
                    unit.cancel_with_error(OpError::TimedOut {
                        after_ms: timeout.as_millis() as u64,
                    });
                }
            }
        });
    }
}
