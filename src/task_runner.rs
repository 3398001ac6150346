/// Background loop runner with circuit-breaker accounting.
///
/// Wraps the fixed-interval engine loops (reconcile tick, backfill sweep,
/// snapshot save) with consecutive-failure tracking and exponential backoff.
/// Nothing terminates the process: past the failure threshold the loop keeps
/// retrying at the capped delay and escalates its log level.
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Consecutive failures before the loop is reported as degraded.
    pub max_consecutive_failures: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            max_consecutive_failures: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct LoopState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl LoopState {
    fn new(initial: Duration) -> Self {
        LoopState { consecutive_failures: 0, current_retry_delay: initial }
    }

    fn record_failure(&mut self, max_delay: Duration) {
        self.consecutive_failures += 1;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
    }

    fn reset(&mut self, initial: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial;
    }
}

/// Run `task_fn` every `interval`, backing off on failures.
pub async fn run_interval_loop<F, Fut, E>(
    task_name: &'static str,
    interval: Duration,
    config: LoopConfig,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut state = LoopState::new(config.initial_retry_delay);

    loop {
        match task_fn().await {
            Ok(()) => {
                state.reset(config.initial_retry_delay);
                sleep(interval).await;
            }
            Err(e) => {
                state.record_failure(config.max_retry_delay);
                if state.consecutive_failures >= config.max_consecutive_failures {
                    error!(
                        task = task_name,
                        failures = state.consecutive_failures,
                        error = %e,
                        "background loop degraded; continuing with capped backoff"
                    );
                } else {
                    warn!(
                        task = task_name,
                        failures = state.consecutive_failures,
                        error = %e,
                        "background loop iteration failed"
                    );
                }
                sleep(state.current_retry_delay).await;
            }
        }
    }
}
