//! Shared scaffolding for the flow-scenario integration tests (§8
//! end-to-end scenarios). Wires a real planner + executor + orchestrator
//! + work runner against the in-memory store and a scripted dispatcher,
//! the way a caller outside this crate would assemble the pieces.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use argyll::bus::InMemoryEventHub;
use argyll::events::FlowEvent;
use argyll::executor::EventExecutor;
use argyll::memo::LruMemoCache;
use argyll::model::step::{AttributeSpec, AttributeType, HttpConfig, Name, Role, Step, StepId, StepType, WorkConfig};
use argyll::model::{FlowId, FlowState};
use argyll::orchestrator::FlowOrchestrator;
use argyll::persistence::{AggregateKey, EventStore, InMemoryEventStore};
use argyll::planner;
use argyll::work::{StepDispatcher, WorkRunner, WorkerPoolConfig};

pub type TestOrchestrator<D> = FlowOrchestrator<InMemoryEventStore, D, LruMemoCache>;

/// A minimal `sync` HTTP step with the given required/optional inputs and
/// declared outputs, default work config (no retries).
pub fn http_step(id: &str, inputs: &[(&str, Role)], outputs: &[&str]) -> Step {
    let mut attributes = BTreeMap::new();
    for (name, role) in inputs {
        let spec = match role {
            Role::Required => AttributeSpec::required(AttributeType::String),
            Role::Optional => AttributeSpec::optional(AttributeType::String),
            _ => AttributeSpec::required(AttributeType::String),
        };
        attributes.insert(name.to_string(), spec);
    }
    for name in outputs {
        attributes.insert(name.to_string(), AttributeSpec::output(AttributeType::String));
    }
    Step {
        id: id.to_string(),
        name: id.to_string(),
        step_type: StepType::Sync {
            http: HttpConfig {
                endpoint: format!("http://localhost/{id}"),
                timeout: Duration::from_secs(5),
            },
        },
        attributes,
        predicate: None,
        work_config: WorkConfig::default(),
        memoizable: false,
        labels: BTreeMap::new(),
    }
}

pub fn catalog(steps: Vec<Step>) -> BTreeMap<StepId, Step> {
    steps.into_iter().map(|s| (s.id.clone(), s)).collect()
}

/// Builds an orchestrator and the executor backing it, sharing one
/// in-memory store, over the given dispatcher.
pub fn build<D: StepDispatcher>(dispatcher: Arc<D>) -> (Arc<EventExecutor<InMemoryEventStore>>, TestOrchestrator<D>) {
    build_with_config(dispatcher, WorkerPoolConfig::default())
}

/// As [`build`], with an explicit [`WorkerPoolConfig`] (e.g. a
/// `webhook_base_url` for `async` step scenarios).
pub fn build_with_config<D: StepDispatcher>(
    dispatcher: Arc<D>,
    config: WorkerPoolConfig,
) -> (Arc<EventExecutor<InMemoryEventStore>>, TestOrchestrator<D>) {
    let hub = Arc::new(InMemoryEventHub::new());
    let executor = Arc::new(EventExecutor::new(InMemoryEventStore::new()).with_flow_hub(hub.clone()));
    let work_runner = Arc::new(WorkRunner::with_config(
        executor.clone(),
        hub,
        dispatcher,
        Arc::new(LruMemoCache::new(64)),
        config,
    ));
    let orchestrator = FlowOrchestrator::new(executor.clone(), work_runner);
    (executor, orchestrator)
}

/// Plans and starts a flow, mirroring the `start_flow` command handler
/// (§4.3, §4.5): compute the plan, then raise `flow_started` carrying it.
pub async fn start(
    executor: &EventExecutor<InMemoryEventStore>,
    flow_id: FlowId,
    goals: &[&str],
    init: BTreeMap<Name, Value>,
    catalog: &BTreeMap<StepId, Step>,
) -> FlowState {
    let goal_ids: Vec<StepId> = goals.iter().map(|g| g.to_string()).collect();
    let plan = planner::plan(&goal_ids, &init, catalog).expect("plan should succeed in this scenario");
    executor
        .exec_flow(flow_id, || FlowState::new(flow_id, Utc::now()), |_| {
            Ok(vec![FlowEvent::FlowStarted {
                plan: plan.clone(),
                init: init.clone(),
            }])
        })
        .await
        .expect("flow_started should append cleanly on a fresh stream")
}

/// The full event log recorded for a flow, in append order.
pub async fn events(executor: &EventExecutor<InMemoryEventStore>, flow_id: FlowId) -> Vec<FlowEvent> {
    let key = AggregateKey::Flow(flow_id.to_string());
    let (stored, _version) = EventStore::<FlowEvent>::load(executor.store().as_ref(), &key)
        .await
        .expect("load should never fail against the in-memory store");
    stored.into_iter().map(|e| e.data).collect()
}

/// The event's §4.5/§4.6 wire name, for asserting scenario event order
/// without matching on full payloads.
pub fn kind(event: &FlowEvent) -> &'static str {
    match event {
        FlowEvent::FlowStarted { .. } => "flow_started",
        FlowEvent::ChildFlowLinked { .. } => "child_flow_linked",
        FlowEvent::AttributeSet { .. } => "attribute_set",
        FlowEvent::StepStarted { .. } => "step_started",
        FlowEvent::StepCompleted { .. } => "step_completed",
        FlowEvent::StepSkipped { .. } => "step_skipped",
        FlowEvent::StepFailed { .. } => "step_failed",
        FlowEvent::WorkStarted { .. } => "work_started",
        FlowEvent::WorkSucceeded { .. } => "work_succeeded",
        FlowEvent::WorkFailed { .. } => "work_failed",
        FlowEvent::RetryScheduled { .. } => "retry_scheduled",
        FlowEvent::FlowCompleted { .. } => "flow_completed",
        FlowEvent::FlowFailed { .. } => "flow_failed",
        FlowEvent::FlowStopped { .. } => "flow_stopped",
    }
}

/// Drives `tick` until the flow is terminal or `max_ticks` is exhausted,
/// for scenarios with no retry waits involved.
pub async fn run_to_terminal<D: StepDispatcher>(
    orchestrator: &TestOrchestrator<D>,
    flow_id: FlowId,
    max_ticks: usize,
) -> FlowState {
    let mut state = FlowState::new(flow_id, Utc::now());
    for _ in 0..max_ticks {
        state = orchestrator.tick(flow_id, Utc::now()).await.expect("tick should not error");
        if state.status.is_terminal() {
            break;
        }
    }
    state
}
