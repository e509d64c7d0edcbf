//! Single cooperative retry ticker (§4.8): scans for due retries instead
//! of arming one timer per work item.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::model::flow::FlowState;
use crate::model::step::StepId;
use crate::model::work::{Token, WorkStatus};

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl RetrySchedulerConfig {
    /// Reads `ARGYLL_RETRY_TICK_INTERVAL_MS`, falling back to [`Default`]
    /// when unset or unparseable (§B "Configuration").
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(millis) = crate::executor::parse_env_var::<u64>("ARGYLL_RETRY_TICK_INTERVAL_MS") {
            config.tick_interval = Duration::from_millis(millis);
        }
        config
    }
}

/// Work items with `Status=pending` and `NextRetryAt <= now` (§4.8).
/// Pure function; the caller drives the tick loop and re-dispatches.
#[instrument(skip(flow))]
pub fn due_retries(flow: &FlowState, now: DateTime<Utc>) -> Vec<(StepId, Token)> {
    let mut due = Vec::new();
    for (step_id, exec) in &flow.executions {
        for (token, work) in &exec.work_items {
            if work.status == WorkStatus::Pending {
                if let Some(next_retry_at) = work.next_retry_at {
                    if next_retry_at <= now {
                        due.push((step_id.clone(), token.clone()));
                    }
                }
            }
        }
    }
    due
}

/// Drives `due_retries` on a fixed tick, invoking `on_due` for every flow
/// id the caller wants scanned. Runs until the token is cancelled.
pub struct RetryScheduler {
    config: RetrySchedulerConfig,
}

impl RetryScheduler {
    pub fn new(config: RetrySchedulerConfig) -> Self {
        Self { config }
    }

    /// Ticks forever, calling `on_tick` once per interval. `on_tick` is
    /// responsible for scanning whichever flows it owns via
    /// `due_retries` and re-dispatching; this loop only owns timing.
    pub async fn run<F, Fut>(&self, mut on_tick: F, mut shutdown: tokio::sync::watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    on_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
