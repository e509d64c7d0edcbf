//! Thin contract over the event store: load, run a pure command, CAS
//! append, retry on conflict (§4.1).

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::bus::{EventHub, SharedEventHub};
use crate::errors::ConcurrencyError;
use crate::events::{EngineEvent, FlowEvent};
use crate::model::engine::EngineState;
use crate::model::flow::{FlowId, FlowState};
use crate::persistence::{AggregateKey, EventStore, StoreError};
use crate::reducers::{engine_reducer, flow_reducer};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bounded retry budget on `OptimisticConflictExhausted` (§4.1,
    /// §E "matching the teacher's retry-budget-by-config idiom").
    pub max_cas_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_cas_retries: 5 }
    }
}

impl ExecutorConfig {
    /// Reads `ARGYLL_MAX_CAS_RETRIES`, falling back to [`Default`] when
    /// unset or unparseable (§B "Configuration").
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(retries) = parse_env_var("ARGYLL_MAX_CAS_RETRIES") {
            config.max_cas_retries = retries;
        }
        config
    }
}

pub(crate) fn parse_env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("command error: {0}")]
    Command(String),
}

/// `Exec(key, cmd)`, generic over one aggregate's `(state, event)` pair.
/// `S` is the backing store, pre-wired for both aggregates via
/// `exec_flow`/`exec_engine` below.
pub struct EventExecutor<S> {
    store: Arc<S>,
    config: ExecutorConfig,
    /// Topic producers publish to after the Executor commits an append
    /// (§5 "producers publish after Executor commit"). Absent for
    /// executors that never need sub-flow/webhook consumers (e.g. bench
    /// harnesses), present in production wiring.
    flow_hub: Option<SharedEventHub<(FlowId, FlowEvent)>>,
}

impl<S> EventExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            config: ExecutorConfig::default(),
            flow_hub: None,
        }
    }

    pub fn with_config(store: S, config: ExecutorConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
            flow_hub: None,
        }
    }

    /// Attaches the bus this executor publishes committed `FlowEvent`s to.
    pub fn with_flow_hub(mut self, hub: SharedEventHub<(FlowId, FlowEvent)>) -> Self {
        self.flow_hub = Some(hub);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S> EventExecutor<S>
where
    S: EventStore<FlowEvent>,
{
    /// Loads `flow_id`'s stream, replays it onto `initial`, runs `cmd`
    /// against the resulting read-only state, and CAS-appends whatever
    /// events it raises. Retries the whole load-run-append cycle on
    /// `ConcurrencyConflict` up to `max_cas_retries` times.
    #[instrument(skip(self, initial, cmd), fields(flow_id = %flow_id))]
    pub async fn exec_flow<F>(
        &self,
        flow_id: FlowId,
        initial: impl Fn() -> FlowState,
        cmd: F,
    ) -> Result<FlowState, ExecutorError>
    where
        F: Fn(&FlowState) -> Result<Vec<FlowEvent>, String>,
    {
        let key = AggregateKey::Flow(flow_id.to_string());
        let mut attempt = 0;

        loop {
            let (stored, version) = EventStore::<FlowEvent>::load(self.store.as_ref(), &key).await?;
            let mut state = initial();
            for event in &stored {
                state = flow_reducer(state, &event.data);
            }

            let raised = cmd(&state).map_err(ExecutorError::Command)?;
            if raised.is_empty() {
                return Ok(state);
            }

            match EventStore::<FlowEvent>::append(self.store.as_ref(), &key, version, raised.clone())
                .await
            {
                Ok(_) => {
                    for event in &raised {
                        state = flow_reducer(state, event);
                    }
                    if let Some(hub) = &self.flow_hub {
                        for event in raised {
                            hub.publish((flow_id, event)).await;
                        }
                    }
                    return Ok(state);
                }
                Err(StoreError::ConcurrencyConflict { .. }) => {
                    attempt += 1;
                    if attempt > self.config.max_cas_retries {
                        warn!(%flow_id, attempt, "exhausted CAS retry budget");
                        return Err(ExecutorError::Concurrency(
                            ConcurrencyError::OptimisticConflictExhausted {
                                key: key.to_string(),
                                attempts: attempt,
                            },
                        ));
                    }
                    debug!(%flow_id, attempt, "CAS conflict, retrying");
                    continue;
                }
                Err(other) => return Err(ExecutorError::Store(other)),
            }
        }
    }
}

impl<S> EventExecutor<S>
where
    S: EventStore<EngineEvent>,
{
    #[instrument(skip(self, cmd))]
    pub async fn exec_engine<F>(&self, cmd: F) -> Result<EngineState, ExecutorError>
    where
        F: Fn(&EngineState) -> Result<Vec<EngineEvent>, String>,
    {
        let key = AggregateKey::Engine;
        let mut attempt = 0;

        loop {
            let (stored, version) =
                EventStore::<EngineEvent>::load(self.store.as_ref(), &key).await?;
            let mut state = EngineState::new();
            for event in &stored {
                state = engine_reducer(state, &event.data);
            }

            let raised = cmd(&state).map_err(ExecutorError::Command)?;
            if raised.is_empty() {
                return Ok(state);
            }

            match EventStore::<EngineEvent>::append(self.store.as_ref(), &key, version, raised.clone())
                .await
            {
                Ok(_) => {
                    for event in &raised {
                        state = engine_reducer(state, event);
                    }
                    return Ok(state);
                }
                Err(StoreError::ConcurrencyConflict { .. }) => {
                    attempt += 1;
                    if attempt > self.config.max_cas_retries {
                        warn!(attempt, "exhausted CAS retry budget for engine aggregate");
                        return Err(ExecutorError::Concurrency(
                            ConcurrencyError::OptimisticConflictExhausted {
                                key: key.to_string(),
                                attempts: attempt,
                            },
                        ));
                    }
                    debug!(attempt, "CAS conflict on engine aggregate, retrying");
                    continue;
                }
                Err(other) => return Err(ExecutorError::Store(other)),
            }
        }
    }
}
