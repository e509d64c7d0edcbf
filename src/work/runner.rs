//! Input binding, memoization probe, dispatch, and result interpretation
//! for one step's work items (§4.6).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::instrument;
use uuid::Uuid;

use super::dispatch::{build_receipt_token, DispatchError, DispatchMetadata, DispatchRequest, StepDispatcher};
use super::retry::backoff_for_attempt;
use crate::bus::{Consumer, EventHub, SharedEventHub};
use crate::events::FlowEvent;
use crate::executor::EventExecutor;
use crate::memo::{memo_key, MemoCache};
use crate::model::attribute::{AttributeMap, Name};
use crate::model::flow::FlowId;
use crate::model::step::{FlowConfig, Role, Step, StepType};
use crate::model::work::WorkError;
use crate::persistence::EventStore;

/// Work Runner tuning, mirroring the teacher's `RunnerConfig::from_env`
/// convention: sensible defaults, overridable by environment variables for
/// local experimentation and the `src/bin/` smoke-test binaries.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Base URL external step handlers POST webhook callbacks to for
    /// `async` steps. `None` means this deployment has no externally
    /// reachable webhook endpoint; `async` steps then have no `webhook_url`
    /// in their dispatch metadata and must be resolved some other way.
    pub webhook_base_url: Option<String>,

    /// Fallback dispatch timeout for step types that don't carry their own
    /// `HttpConfig.timeout` (currently only `script`).
    pub default_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            webhook_base_url: None,
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var("ARGYLL_WEBHOOK_BASE_URL") {
            config.webhook_base_url = Some(base);
        }
        if let Ok(secs) = std::env::var("ARGYLL_DEFAULT_STEP_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.default_timeout = Duration::from_secs(secs);
            }
        }
        config
    }
}

/// One bound work item awaiting dispatch.
pub struct BoundWork {
    pub token: String,
    pub inputs: BTreeMap<Name, Value>,
}

/// Splits a step's resolved inputs into one or more work items, Cartesian
/// fanning-out every `for_each` input (§4.6 step 1).
///
/// `resolved` must already contain a value for every required/optional
/// input the step needs to launch, including step-local defaults for any
/// optional input whose timeout has expired (§4.5 step 2) — the orchestrator
/// resolves timeouts before calling this, since only it tracks per-flow
/// timeout clocks.
pub fn bind_work_items(step: &Step, resolved: &BTreeMap<Name, Value>) -> Vec<BoundWork> {
    let for_each_names: Vec<&Name> = step
        .attributes
        .iter()
        .filter(|(_, spec)| spec.for_each)
        .map(|(name, _)| name)
        .collect();

    if for_each_names.is_empty() {
        return vec![BoundWork {
            token: "t0".to_string(),
            inputs: resolved.clone(),
        }];
    }

    let mut for_each_names = for_each_names;
    for_each_names.sort();

    let arrays: Vec<(&Name, &Vec<Value>)> = for_each_names
        .iter()
        .filter_map(|name| match resolved.get(*name) {
            Some(Value::Array(items)) => Some((*name, items)),
            _ => None,
        })
        .collect();

    let mut combos: Vec<BTreeMap<Name, Value>> = vec![BTreeMap::new()];
    for (name, items) in &arrays {
        let mut next = Vec::with_capacity(combos.len() * items.len());
        for combo in &combos {
            for item in items.iter() {
                let mut c = combo.clone();
                c.insert((*name).clone(), item.clone());
                next.push(c);
            }
        }
        combos = next;
    }

    combos
        .into_iter()
        .enumerate()
        .map(|(i, mut combo)| {
            for (name, value) in resolved {
                if !for_each_names.contains(&name) {
                    combo.insert(name.clone(), value.clone());
                }
            }
            BoundWork {
                token: format!("t{i}"),
                inputs: combo,
            }
        })
        .collect()
}

/// Outcome of running one work item through memoization and dispatch.
pub enum WorkOutcome {
    MemoHit {
        outputs: BTreeMap<Name, Value>,
    },
    Succeeded {
        outputs: BTreeMap<Name, Value>,
    },
    Retryable {
        error: WorkError,
    },
    Permanent {
        error: WorkError,
    },
    /// Submitted successfully but not yet resolved (§9 "Coroutine/callback
    /// async steps"): an `async` handler acknowledged receipt and will
    /// resolve later via a webhook payload keyed by `receipt_token`, not by
    /// this call continuing to wait. No event is raised for this outcome;
    /// `WorkStarted` already recorded the attempt.
    Pending,
}

pub struct WorkRunner<S, D, M> {
    executor: Arc<EventExecutor<S>>,
    hub: SharedEventHub<(FlowId, FlowEvent)>,
    dispatcher: Arc<D>,
    memo: Arc<M>,
    config: WorkerPoolConfig,
    planner_config: crate::planner::PlannerConfig,
}

impl<S, D, M> WorkRunner<S, D, M>
where
    S: EventStore<FlowEvent> + EventStore<crate::events::EngineEvent>,
    D: StepDispatcher,
    M: MemoCache,
{
    pub fn new(
        executor: Arc<EventExecutor<S>>,
        hub: SharedEventHub<(FlowId, FlowEvent)>,
        dispatcher: Arc<D>,
        memo: Arc<M>,
    ) -> Self {
        Self::with_config(executor, hub, dispatcher, memo, WorkerPoolConfig::default())
    }

    pub fn with_config(
        executor: Arc<EventExecutor<S>>,
        hub: SharedEventHub<(FlowId, FlowEvent)>,
        dispatcher: Arc<D>,
        memo: Arc<M>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            executor,
            hub,
            dispatcher,
            memo,
            config,
            planner_config: crate::planner::PlannerConfig::default(),
        }
    }

    /// Overrides the bound applied to sub-flow child plans (§9 "Sub-flow
    /// composition"); defaults to [`PlannerConfig::default`].
    pub fn with_planner_config(mut self, planner_config: crate::planner::PlannerConfig) -> Self {
        self.planner_config = planner_config;
        self
    }

    /// Runs every bound work item for `step` concurrently, bounded by
    /// `WorkConfig.parallelism` (§5 "Work dispatch is bounded per step by
    /// `WorkConfig.Parallelism`").
    #[instrument(skip(self, step, work_items), fields(step_id = %step.id))]
    pub async fn dispatch_all(
        &self,
        flow_id: FlowId,
        step: &Step,
        work_items: Vec<BoundWork>,
    ) -> Vec<(String, WorkOutcome)> {
        let semaphore = Arc::new(Semaphore::new(step.work_config.parallelism.max(1)));
        let futures = work_items.into_iter().map(|work| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let outcome = self.run_one(flow_id, step, &work).await;
                (work.token, outcome)
            }
        });
        join_all(futures).await
    }

    async fn run_one(&self, flow_id: FlowId, step: &Step, work: &BoundWork) -> WorkOutcome {
        if let StepType::Flow { flow } = &step.step_type {
            return self.run_sub_flow(flow_id, step, flow, work).await;
        }

        if step.memoizable {
            let key = memo_key(step, &work.inputs);
            if let Some(outputs) = self.memo.get(&key) {
                return WorkOutcome::MemoHit { outputs };
            }
        }

        let receipt_token = build_receipt_token(flow_id, &step.id, &work.token);
        let webhook_url = match &step.step_type {
            StepType::Async { .. } => self
                .config
                .webhook_base_url
                .as_ref()
                .map(|base| format!("{}/{}", base.trim_end_matches('/'), receipt_token)),
            _ => None,
        };
        let request = DispatchRequest {
            arguments: work.inputs.clone(),
            metadata: DispatchMetadata {
                flow_id,
                step_id: step.id.clone(),
                receipt_token,
                webhook_url,
            },
        };

        match self
            .dispatcher
            .dispatch(request, step_timeout(step, &self.config))
            .await
        {
            Ok(outputs) => {
                // An `async` handler's dispatch call only acknowledges
                // submission; it does not hold the wait across the
                // callback window (§9 "no callback stacks are retained
                // across restarts"). The actual result arrives later via
                // `FlowOrchestrator::handle_webhook`.
                if matches!(step.step_type, StepType::Async { .. }) {
                    return WorkOutcome::Pending;
                }
                if step.memoizable {
                    let key = memo_key(step, &work.inputs);
                    self.memo.put(key, outputs.clone());
                }
                WorkOutcome::Succeeded { outputs }
            }
            Err(err) => {
                let message = err.to_string();
                if err.is_retryable() {
                    WorkOutcome::Retryable {
                        error: WorkError::new(message, true),
                    }
                } else {
                    WorkOutcome::Permanent {
                        error: WorkError::new(message, false),
                    }
                }
            }
        }
    }

    /// Dispatches a `flow` step by starting a child flow and waiting on its
    /// terminal event via the shared bus (§9 "Sub-flow composition"),
    /// rather than delegating to the opaque `StepDispatcher`.
    async fn run_sub_flow(
        &self,
        parent_flow_id: FlowId,
        step: &Step,
        config: &FlowConfig,
        work: &BoundWork,
    ) -> WorkOutcome {
        let engine = match self.executor.exec_engine(|_| Ok(vec![])).await {
            Ok(engine) => engine,
            Err(err) => {
                return WorkOutcome::Permanent {
                    error: WorkError::new(format!("sub-flow catalog load failed: {err}"), false),
                }
            }
        };

        let mut child_init = BTreeMap::new();
        for (from, to) in &config.input_map {
            if let Some(value) = work.inputs.get(from) {
                child_init.insert(to.clone(), value.clone());
            }
        }

        let child_plan = match crate::planner::plan_bounded(&config.goals, &child_init, &engine.catalog, &self.planner_config) {
            Ok(plan) => plan,
            Err(err) => {
                return WorkOutcome::Permanent {
                    error: WorkError::new(format!("sub-flow planning failed: {err}"), false),
                }
            }
        };

        let child_id = Uuid::now_v7();
        let mut consumer = self.hub.new_consumer();

        let started = self
            .executor
            .exec_flow(
                child_id,
                || crate::model::flow::FlowState::new(child_id, Utc::now()),
                |_| {
                    Ok(vec![
                        FlowEvent::FlowStarted {
                            plan: child_plan.clone(),
                            init: child_init.clone(),
                        },
                        FlowEvent::ChildFlowLinked {
                            parent_flow_id,
                            parent_step_id: step.id.clone(),
                            parent_token: work.token.clone(),
                        },
                    ])
                },
            )
            .await;
        if let Err(err) = started {
            return WorkOutcome::Permanent {
                error: WorkError::new(format!("sub-flow start failed: {err}"), false),
            };
        }

        // Marks the child discoverable to whatever external driver ticks
        // active flows forward (§5 "the caller drives the tick loop",
        // matching `work::scheduler`'s own contract) — this runner has no
        // `FlowOrchestrator` handle of its own to drive it directly.
        if let Err(err) = self
            .executor
            .exec_engine(move |_| Ok(vec![crate::events::EngineEvent::FlowActivated { flow_id: child_id }]))
            .await
        {
            return WorkOutcome::Permanent {
                error: WorkError::new(format!("sub-flow activation failed: {err}"), false),
            };
        }

        loop {
            match consumer.receive().await {
                Ok((event_flow_id, event)) if event_flow_id == child_id => match event {
                    FlowEvent::FlowCompleted { .. } => {
                        return self.sub_flow_outputs(child_id, config).await;
                    }
                    FlowEvent::FlowFailed { error } => {
                        return WorkOutcome::Permanent {
                            error: WorkError::new(format!("sub-flow failed: {}", error.message), false),
                        };
                    }
                    FlowEvent::FlowStopped { reason } => {
                        return WorkOutcome::Permanent {
                            error: WorkError::new(format!("sub-flow stopped: {reason}"), false),
                        };
                    }
                    _ => continue,
                },
                Ok(_) => continue,
                Err(_) => {
                    return WorkOutcome::Permanent {
                        error: WorkError::new("event bus closed while awaiting sub-flow", false),
                    };
                }
            }
        }
    }

    async fn sub_flow_outputs(&self, child_id: FlowId, config: &FlowConfig) -> WorkOutcome {
        let child = match self
            .executor
            .exec_flow(child_id, || crate::model::flow::FlowState::new(child_id, Utc::now()), |_| Ok(vec![]))
            .await
        {
            Ok(state) => state,
            Err(err) => {
                return WorkOutcome::Permanent {
                    error: WorkError::new(format!("sub-flow reload failed: {err}"), false),
                }
            }
        };
        let mut outputs = BTreeMap::new();
        for (from, to) in &config.output_map {
            if let Some(attr) = child.attributes.get(from) {
                outputs.insert(to.clone(), attr.value.clone());
            }
        }
        WorkOutcome::Succeeded { outputs }
    }

    /// Translates one work item's outcome plus retry bookkeeping into
    /// the events to raise (§4.6 steps 4-5).
    pub fn interpret(
        &self,
        step: &Step,
        token: &str,
        retry_count: u32,
        outcome: WorkOutcome,
    ) -> Vec<FlowEvent> {
        match outcome {
            WorkOutcome::MemoHit { outputs } | WorkOutcome::Succeeded { outputs } => {
                vec![FlowEvent::WorkSucceeded {
                    step_id: step.id.clone(),
                    token: token.to_string(),
                    outputs,
                }]
            }
            WorkOutcome::Permanent { error } => vec![FlowEvent::WorkFailed {
                step_id: step.id.clone(),
                token: token.to_string(),
                error,
            }],
            WorkOutcome::Retryable { error } => {
                if retry_count < step.work_config.max_retries {
                    let next_attempt = retry_count + 1;
                    let delay = backoff_for_attempt(
                        step.work_config.backoff_type,
                        step.work_config.backoff,
                        step.work_config.max_backoff,
                        next_attempt,
                    );
                    vec![FlowEvent::RetryScheduled {
                        step_id: step.id.clone(),
                        token: token.to_string(),
                        retry_count: next_attempt,
                        next_retry_at: Utc::now()
                            + chrono::Duration::from_std(delay).unwrap_or_default(),
                    }]
                } else {
                    vec![FlowEvent::WorkFailed {
                        step_id: step.id.clone(),
                        token: token.to_string(),
                        error,
                    }]
                }
            }
            // Submitted, awaiting webhook rendezvous; `work_started`
            // already recorded the attempt and nothing further is known
            // yet, so no event is raised (§9).
            WorkOutcome::Pending => vec![],
        }
    }
}

fn step_timeout(step: &Step, config: &WorkerPoolConfig) -> Duration {
    match &step.step_type {
        StepType::Sync { http } => http.timeout,
        StepType::Async { http } => http.timeout,
        StepType::Flow { .. } => config.default_timeout,
        StepType::Script { .. } => config.default_timeout,
    }
}

/// Attributes a step still needs resolved before it can launch: required
/// inputs missing from `attributes`, plus optional inputs missing and not
/// yet timed out. Used by the orchestrator to decide runnability (§4.5
/// step 1).
pub fn unresolved_inputs(step: &Step, attributes: &AttributeMap) -> BTreeSet<Name> {
    step.attributes
        .iter()
        .filter(|(_, spec)| matches!(spec.role, Role::Required | Role::Optional))
        .filter(|(name, _)| !attributes.contains_key(*name))
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::step::{AttributeSpec, AttributeType, HttpConfig, StepType, WorkConfig};

    fn for_each_step() -> Step {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "items".to_string(),
            AttributeSpec::required(AttributeType::Array).with_for_each(),
        );
        attributes.insert("r".to_string(), AttributeSpec::output(AttributeType::String));
        Step {
            id: "fanout".to_string(),
            name: "Fanout".to_string(),
            step_type: StepType::Sync {
                http: HttpConfig {
                    endpoint: "http://localhost/run".to_string(),
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

    #[test]
    fn for_each_produces_one_work_item_per_element_with_sequential_tokens() {
        let step = for_each_step();
        let resolved = BTreeMap::from([(
            "items".to_string(),
            Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("c".into()),
            ]),
        )]);
        let items = bind_work_items(&step, &resolved);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].token, "t0");
        assert_eq!(items[2].token, "t2");
    }

    #[test]
    fn non_for_each_step_yields_single_work_item() {
        let mut attributes = BTreeMap::new();
        attributes.insert("x".to_string(), AttributeSpec::required(AttributeType::String));
        let step = Step {
            id: "s".to_string(),
            name: "S".to_string(),
            step_type: StepType::Sync {
                http: HttpConfig {
                    endpoint: "http://localhost/run".to_string(),
                    timeout: Duration::from_secs(5),
                },
            },
            attributes,
            predicate: None,
            work_config: WorkConfig::default(),
            memoizable: false,
            labels: BTreeMap::new(),
        };
        let resolved = BTreeMap::from([("x".to_string(), Value::String("v".into()))]);
        let items = bind_work_items(&step, &resolved);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].token, "t0");
    }
}
