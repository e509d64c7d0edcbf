//! Engine Orchestrator (§4.7): catalog and health management, and the
//! active/deactivating/archiving flow-set transitions, gated on
//! quiescence.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{info, instrument, warn};

use crate::events::{EngineEvent, FlowEvent};
use crate::executor::{EventExecutor, ExecutorError};
use crate::model::engine::{EngineState, HealthStatus};
use crate::model::flow::{FlowId, FlowState};
use crate::model::step::Step;
use crate::persistence::{AggregateKey, ArchiveRecord, ArchiveSink, EventStore, StoreError};
use crate::reducers::is_redundant_health_change;

#[derive(Debug, Error)]
pub enum EngineOrchestratorError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("flow is not quiescent, cannot transition")]
    NotQuiescent,

    #[error("graceful shutdown timed out with {0} flow(s) still in flight")]
    ShutdownTimeout(usize),
}

#[derive(Debug, Clone)]
pub struct EngineOrchestratorConfig {
    /// Maximum in-flight flow ticks admitted during graceful shutdown
    /// drain (§F "graceful shutdown drain window").
    pub shutdown_timeout: Duration,
    pub shutdown_poll_interval: Duration,
}

impl Default for EngineOrchestratorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            shutdown_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Tracks the catalog, step health, and flow-set membership; gates flow
/// lifecycle transitions on quiescence and owns the graceful-shutdown
/// drain window, the way [`crate::work::scheduler::RetryScheduler`]'s
/// caller owns its tick loop and a `WorkerPool` owns its shutdown drain.
pub struct EngineOrchestrator<S> {
    executor: Arc<EventExecutor<S>>,
    config: EngineOrchestratorConfig,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S> EngineOrchestrator<S>
where
    S: EventStore<EngineEvent>,
{
    pub fn new(executor: Arc<EventExecutor<S>>, config: EngineOrchestratorConfig, max_in_flight: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            executor,
            config,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_in_flight: max_in_flight.max(1),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Admits one unit of in-flight flow work, refusing new admission once
    /// shutdown has been signalled.
    pub async fn admit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if *self.shutdown_rx.borrow() {
            return None;
        }
        self.in_flight.clone().acquire_owned().await.ok()
    }

    #[instrument(skip(self, step))]
    pub async fn register_step(&self, step: Step) -> Result<EngineState, EngineOrchestratorError> {
        Ok(self
            .executor
            .exec_engine(|state| {
                let event = if state.catalog.contains_key(&step.id) {
                    EngineEvent::StepUpdated { step: step.clone() }
                } else {
                    EngineEvent::StepRegistered { step: step.clone() }
                };
                Ok(vec![event])
            })
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn remove_step(&self, step_id: &str) -> Result<EngineState, EngineOrchestratorError> {
        Ok(self
            .executor
            .exec_engine(|_| {
                Ok(vec![EngineEvent::StepRemoved {
                    step_id: step_id.to_string(),
                }])
            })
            .await?)
    }

    /// Reports step health, suppressing the event entirely when it would
    /// be a no-op (§8 "Idempotent health").
    #[instrument(skip(self))]
    pub async fn report_health(
        &self,
        step_id: &str,
        status: HealthStatus,
        error: Option<String>,
    ) -> Result<EngineState, EngineOrchestratorError> {
        Ok(self
            .executor
            .exec_engine(|state| {
                if is_redundant_health_change(state, step_id, &status) {
                    return Ok(vec![]);
                }
                Ok(vec![EngineEvent::StepHealthChanged {
                    step_id: step_id.to_string(),
                    status,
                    error: error.clone(),
                }])
            })
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn activate_flow(&self, flow_id: FlowId) -> Result<EngineState, EngineOrchestratorError> {
        Ok(self
            .executor
            .exec_engine(|_| Ok(vec![EngineEvent::FlowActivated { flow_id }]))
            .await?)
    }

    /// Deactivates a flow once it is quiescent (§4.7 "flows leave the
    /// active set only once quiescent"); refuses otherwise.
    #[instrument(skip(self, flow))]
    pub async fn deactivate_flow(&self, flow: &FlowState) -> Result<EngineState, EngineOrchestratorError> {
        if !flow.is_quiescent() {
            return Err(EngineOrchestratorError::NotQuiescent);
        }
        let flow_id = flow.id;
        Ok(self
            .executor
            .exec_engine(|_| Ok(vec![EngineEvent::FlowDeactivated { flow_id }]))
            .await?)
    }

    /// Stops admitting new flow work and waits for in-flight work to
    /// drain, up to `shutdown_timeout` (§F, mirrors the teacher's
    /// `WorkerPool::shutdown` poll loop).
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), EngineOrchestratorError> {
        info!("engine orchestrator initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.in_flight.available_permits();
            if available == self.max_in_flight {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.max_in_flight - available;
                warn!(remaining, "engine orchestrator shutdown timed out");
                return Err(EngineOrchestratorError::ShutdownTimeout(remaining));
            }
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }
    }
}

impl<S> EngineOrchestrator<S>
where
    S: EventStore<EngineEvent> + EventStore<FlowEvent> + ArchiveSink,
{
    /// Moves a quiescent, deactivated flow into archiving: builds an
    /// [`ArchiveRecord`] from the flow's full event-sourced history and
    /// hands it to the [`ArchiveSink`] backing this same store, then
    /// raises `flow_archiving` (§6 "Archival contract").
    #[instrument(skip(self, flow))]
    pub async fn archive_flow(&self, flow: &FlowState) -> Result<EngineState, EngineOrchestratorError> {
        if !flow.is_quiescent() {
            return Err(EngineOrchestratorError::NotQuiescent);
        }
        let flow_id = flow.id;
        let key = AggregateKey::Flow(flow_id.to_string());
        let (stored, version) = EventStore::<FlowEvent>::load(self.executor.store().as_ref(), &key).await?;

        let snapshot_data = serde_json::to_value(flow)
            .map_err(|err| EngineOrchestratorError::Store(StoreError::Serialization(err.to_string())))?;
        let events = stored
            .iter()
            .map(|e| serde_json::to_value(&e.data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| EngineOrchestratorError::Store(StoreError::Serialization(err.to_string())))?;

        let record = ArchiveRecord {
            stream_id: key.to_string(),
            aggregate_id: flow_id.to_string(),
            snapshot_sequence: version,
            snapshot_data,
            events,
        };
        self.executor.store().submit(record).await?;

        Ok(self
            .executor
            .exec_engine(|_| Ok(vec![EngineEvent::FlowArchiving { flow_id }]))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::step::{HttpConfig, StepType, WorkConfig};
    use crate::persistence::InMemoryEventStore;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    fn sample_step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            step_type: StepType::Sync {
                http: HttpConfig {
                    endpoint: "http://localhost/run".to_string(),
                    timeout: StdDuration::from_secs(5),
                },
            },
            attributes: BTreeMap::new(),
            predicate: None,
            work_config: WorkConfig::default(),
            memoizable: false,
            labels: BTreeMap::new(),
        }
    }

    fn orchestrator() -> EngineOrchestrator<InMemoryEventStore> {
        let executor = Arc::new(EventExecutor::new(InMemoryEventStore::new()));
        EngineOrchestrator::new(executor, EngineOrchestratorConfig::default(), 4)
    }

    #[tokio::test]
    async fn registering_new_step_then_again_emits_update() {
        let orchestrator = orchestrator();
        let state = orchestrator.register_step(sample_step("A")).await.unwrap();
        assert!(state.catalog.contains_key("A"));
        let state = orchestrator.register_step(sample_step("A")).await.unwrap();
        assert!(state.catalog.contains_key("A"));
    }

    #[tokio::test]
    async fn redundant_health_report_is_suppressed() {
        let orchestrator = orchestrator();
        orchestrator
            .report_health("A", HealthStatus::Healthy, None)
            .await
            .unwrap();
        let store = orchestrator.executor.store();
        let (events_before, _) = EventStore::<EngineEvent>::load(
            store.as_ref(),
            &crate::persistence::AggregateKey::Engine,
        )
        .await
        .unwrap();
        orchestrator
            .report_health("A", HealthStatus::Healthy, None)
            .await
            .unwrap();
        let (events_after, _) = EventStore::<EngineEvent>::load(
            store.as_ref(),
            &crate::persistence::AggregateKey::Engine,
        )
        .await
        .unwrap();
        assert_eq!(events_before.len(), events_after.len());
    }

    #[tokio::test]
    async fn deactivate_refuses_non_quiescent_flow() {
        let orchestrator = orchestrator();
        let mut flow = FlowState::new(FlowId::nil(), Utc::now());
        flow.executions.insert(
            "A".to_string(),
            crate::model::flow::ExecutionState {
                status: crate::model::flow::StepStatus::Active,
                ..crate::model::flow::ExecutionState::pending()
            },
        );
        let err = orchestrator.deactivate_flow(&flow).await.unwrap_err();
        assert!(matches!(err, EngineOrchestratorError::NotQuiescent));
    }

    #[tokio::test]
    async fn shutdown_completes_immediately_when_nothing_in_flight() {
        let orchestrator = orchestrator();
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn archive_flow_submits_a_record_built_from_the_flow_stream() {
        let orchestrator = orchestrator();
        let flow_id = FlowId::now_v7();

        orchestrator
            .executor
            .exec_flow(flow_id, || FlowState::new(flow_id, Utc::now()), |_| {
                Ok(vec![crate::events::FlowEvent::FlowStopped {
                    reason: "done".to_string(),
                }])
            })
            .await
            .unwrap();
        let flow = orchestrator
            .executor
            .exec_flow(flow_id, || FlowState::new(flow_id, Utc::now()), |_| Ok(vec![]))
            .await
            .unwrap();

        let engine_state = orchestrator.archive_flow(&flow).await.unwrap();
        assert!(engine_state.archiving.contains(&flow_id));

        let record = orchestrator
            .executor
            .store()
            .poll_archive(StdDuration::from_millis(100))
            .await
            .unwrap()
            .expect("archive_flow should have submitted a record");
        assert_eq!(record.aggregate_id, flow_id.to_string());
        assert_eq!(record.events.len(), 1);
    }

    #[tokio::test]
    async fn archive_flow_refuses_non_quiescent_flow() {
        let orchestrator = orchestrator();
        let mut flow = FlowState::new(FlowId::nil(), Utc::now());
        flow.executions.insert(
            "A".to_string(),
            crate::model::flow::ExecutionState {
                status: crate::model::flow::StepStatus::Active,
                ..crate::model::flow::ExecutionState::pending()
            },
        );
        let err = orchestrator.archive_flow(&flow).await.unwrap_err();
        assert!(matches!(err, EngineOrchestratorError::NotQuiescent));
    }
}
