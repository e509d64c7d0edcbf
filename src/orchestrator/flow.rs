//! Flow Orchestrator (§4.5): the single decision point that turns a
//! flow's current state into launches, attribute writes, and
//! termination. Every function here up to [`FlowOrchestrator`] itself is
//! a pure `(state, ...) -> events` projection with no I/O, mirroring the
//! command/cmd contract [`crate::executor::EventExecutor`] expects —
//! dispatch happens outside, driven by [`FlowOrchestrator::tick`] and
//! [`FlowOrchestrator::record_outcomes`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use super::predicate;
use crate::events::{EngineEvent, FlowEvent};
use crate::executor::{EventExecutor, ExecutorError};
use crate::memo::MemoCache;
use crate::model::attribute::{AttributeEdges, Name};
use crate::model::flow::{FlowError, FlowId, FlowState, FlowStatus, StepStatus};
use crate::model::plan::ExecutionPlan;
use crate::model::step::{AttributeSpec, Step, StepId};
use crate::model::work::{Token, WorkError, WorkStatus};
use crate::persistence::EventStore;
use crate::work::{
    bind_work_items, due_retries, parse_receipt_token, BoundWork, DispatchResponse, StepDispatcher,
    WorkOutcome, WorkRunner,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("invalid receipt token: {0}")]
    InvalidReceiptToken(String),

    #[error("receipt token names unknown step {0:?}")]
    UnknownStep(StepId),
}

/// One step launched this tick, with its fully resolved inputs (required
/// plus optional, defaults already applied for timed-out optionals) ready
/// for [`bind_work_items`].
pub struct Launch {
    pub step_id: StepId,
    pub resolved: BTreeMap<Name, Value>,
}

/// Result of one launch decision pass (§4.5 steps 1-2).
#[derive(Default)]
pub struct LaunchPlan {
    pub events: Vec<FlowEvent>,
    pub launches: Vec<Launch>,
}

/// True if `name`'s only in-plan providers have all reached a terminal
/// status without ever appearing in `flow.attributes` — i.e. it can never
/// resolve (§4.5 step 1 "unreachable required input").
fn is_unreachable(flow: &FlowState, attributes: &BTreeMap<Name, AttributeEdges>, name: &str) -> bool {
    if flow.attributes.contains_key(name) {
        return false;
    }
    let Some(edges) = attributes.get(name) else {
        return false;
    };
    if edges.providers.is_empty() {
        return false;
    }
    edges.providers.iter().all(|p| {
        flow.executions
            .get(p)
            .map(|e| e.status.is_terminal())
            .unwrap_or(false)
    })
}

/// Whether an unresolved optional input is still worth waiting for: it
/// has a live in-plan provider and either no timeout (wait indefinitely
/// while a producer could still run) or a timeout that hasn't elapsed yet,
/// measured from the earliest provider's `started_at` (§3 `AttributeSpec`
/// "Cooperative timeout ... starting when the first upstream provider
/// enters active").
fn optional_is_blocking(
    flow: &FlowState,
    attributes: &BTreeMap<Name, AttributeEdges>,
    name: &str,
    spec: &AttributeSpec,
    now: DateTime<Utc>,
) -> bool {
    if flow.attributes.contains_key(name) {
        return false;
    }
    let Some(edges) = attributes.get(name) else {
        return false;
    };
    if edges.providers.is_empty() {
        return false;
    }
    let all_terminal = edges.providers.iter().all(|p| {
        flow.executions
            .get(p)
            .map(|e| e.status.is_terminal())
            .unwrap_or(false)
    });
    if all_terminal {
        return false;
    }
    match spec.timeout {
        None => true,
        Some(timeout) => {
            let earliest_start = edges
                .providers
                .iter()
                .filter_map(|p| flow.executions.get(p).and_then(|e| e.started_at))
                .min();
            match earliest_start {
                None => true,
                Some(start) => now - start < ChronoDuration::from_std(timeout).unwrap_or_default(),
            }
        }
    }
}

/// Decides launches and skips for every `pending` step in the plan, in
/// step-id order (§4.5 step 1 "deterministic by sorted StepID").
#[instrument(skip(flow), fields(flow_id = %flow.id))]
pub fn plan_launches(flow: &FlowState, now: DateTime<Utc>) -> LaunchPlan {
    let mut out = LaunchPlan::default();
    let Some(plan) = &flow.plan else {
        return out;
    };
    if flow.status.is_terminal() {
        return out;
    }

    for (step_id, step) in &plan.steps {
        let Some(exec) = flow.executions.get(step_id) else {
            continue;
        };
        if exec.status != StepStatus::Pending {
            continue;
        }

        let mut resolved = BTreeMap::new();
        let mut unreachable_name = None;
        let mut blocked = false;
        for name in step.required_inputs() {
            if let Some(value) = flow.attributes.get(name) {
                resolved.insert(name.clone(), value.value.clone());
            } else if is_unreachable(flow, &plan.attributes, name) {
                unreachable_name = Some(name.clone());
                break;
            } else {
                blocked = true;
            }
        }

        if let Some(name) = unreachable_name {
            out.events.push(FlowEvent::StepSkipped {
                step_id: step_id.clone(),
                reason: format!("required input `{name}` has no reachable producer"),
            });
            continue;
        }
        if blocked {
            continue;
        }

        let mut optional_blocked = false;
        for name in step.optional_inputs() {
            if let Some(value) = flow.attributes.get(name) {
                resolved.insert(name.clone(), value.value.clone());
                continue;
            }
            let spec = &step.attributes[name];
            if optional_is_blocking(flow, &plan.attributes, name, spec, now) {
                optional_blocked = true;
                break;
            }
            if let Some(default) = &spec.default {
                resolved.insert(name.clone(), default.clone());
            }
        }
        if optional_blocked {
            continue;
        }

        if let Some(expr) = &step.predicate {
            match predicate::evaluate(expr, &flow.attributes) {
                Ok(true) => {}
                Ok(false) => {
                    out.events.push(FlowEvent::StepSkipped {
                        step_id: step_id.clone(),
                        reason: "predicate evaluated false".to_string(),
                    });
                    continue;
                }
                Err(err) => {
                    out.events.push(FlowEvent::StepSkipped {
                        step_id: step_id.clone(),
                        reason: format!("predicate error: {err}"),
                    });
                    continue;
                }
            }
        }

        out.events.push(FlowEvent::StepStarted {
            step_id: step_id.clone(),
            started_at: now,
        });
        out.launches.push(Launch {
            step_id: step_id.clone(),
            resolved,
        });
    }

    out
}

/// True if every token in `step_id`'s execution has reached a terminal
/// work status (§4.6 step 5 "step completes once every work item is
/// terminal").
fn step_work_is_terminal(flow: &FlowState, step_id: &str) -> bool {
    flow.executions
        .get(step_id)
        .map(|exec| {
            !exec.work_items.is_empty()
                && exec.work_items.values().all(|w| w.status.is_terminal())
        })
        .unwrap_or(false)
}

/// Aggregates a finished step's per-token outputs into `{name: [values]}`
/// and, separately, the flow-attribute value to publish for each output
/// name: the full array for a `for_each` step, the lone value otherwise
/// (§3 `AttributeValue` is scalar; a `for_each` step's attribute is the
/// array it produced).
fn aggregate_outputs(step: &Step, flow: &FlowState) -> BTreeMap<Name, Vec<Value>> {
    let exec = &flow.executions[&step.id];
    let mut tokens: Vec<&String> = exec.work_items.keys().collect();
    tokens.sort();

    let mut aggregated: BTreeMap<Name, Vec<Value>> = BTreeMap::new();
    for name in step.outputs() {
        let values: Vec<Value> = tokens
            .iter()
            .filter_map(|t| {
                exec.work_items[*t]
                    .outputs
                    .as_ref()
                    .and_then(|o| o.get(name))
                    .cloned()
            })
            .collect();
        aggregated.insert(name.clone(), values);
    }
    aggregated
}

/// Builds the events to raise once `step_id`'s work items are all
/// terminal: per-output `attribute_set` (in output-name order) followed
/// by `step_completed`, or `step_failed` if any item failed (§4.6 step 5).
fn finish_step(flow: &FlowState, step: &Step, now: DateTime<Utc>) -> Vec<FlowEvent> {
    let exec = &flow.executions[&step.id];
    let any_failed = exec
        .work_items
        .values()
        .any(|w| w.status == WorkStatus::Failed || w.status == WorkStatus::NotCompleted);

    if any_failed {
        let error = exec
            .work_items
            .values()
            .find_map(|w| w.error.clone())
            .unwrap_or_else(|| crate::model::work::WorkError::new("work item failed", false));
        return vec![FlowEvent::StepFailed {
            step_id: step.id.clone(),
            error,
        }];
    }

    let aggregated = aggregate_outputs(step, flow);
    let mut events = Vec::new();
    for name in step.outputs() {
        let values = &aggregated[name];
        let value = if step.has_for_each_input() {
            Value::Array(values.clone())
        } else {
            values.first().cloned().unwrap_or(Value::Null)
        };
        events.push(FlowEvent::AttributeSet {
            name: name.clone(),
            value,
            step: step.id.clone(),
        });
    }
    events.push(FlowEvent::StepCompleted {
        step_id: step.id.clone(),
        outputs: aggregated,
        completed_at: now,
    });
    events
}

/// Whether `plan`'s goal `goal_id` can still possibly resolve, given the
/// current execution statuses: false only once every path to its
/// required inputs is blocked by terminal non-producing steps (§4.5
/// "Termination" reachability analysis).
fn goal_is_reachable(flow: &FlowState, plan: &ExecutionPlan, goal_id: &str) -> bool {
    fn step_reachable(
        flow: &FlowState,
        plan: &ExecutionPlan,
        step_id: &str,
        cache: &mut BTreeMap<StepId, bool>,
    ) -> bool {
        if let Some(cached) = cache.get(step_id) {
            return *cached;
        }
        cache.insert(step_id.to_string(), true); // break cycles optimistically; plan is acyclic anyway
        let Some(exec) = flow.executions.get(step_id) else {
            return true;
        };
        if exec.status == StepStatus::Completed {
            cache.insert(step_id.to_string(), true);
            return true;
        }
        if exec.status == StepStatus::Failed || exec.status == StepStatus::Skipped {
            cache.insert(step_id.to_string(), false);
            return false;
        }
        let Some(step) = plan.steps.get(step_id) else {
            return true;
        };
        let reachable = step.required_inputs().into_iter().all(|name| {
            if flow.attributes.contains_key(name) {
                return true;
            }
            let Some(edges) = plan.attributes.get(name) else {
                return false;
            };
            edges
                .providers
                .iter()
                .any(|p| step_reachable(flow, plan, p, cache))
        });
        cache.insert(step_id.to_string(), reachable);
        reachable
    }

    let mut cache = BTreeMap::new();
    step_reachable(flow, plan, goal_id, &mut cache)
}

/// Checks whether `triggering_step`'s new terminal status blocks the
/// flow's remaining goals, raising `flow_failed` if so. Called after
/// `step_failed` and `step_skipped` (§4.5 "Termination").
fn check_failure_termination(flow: &FlowState, triggering_step: &StepId, now: DateTime<Utc>) -> Option<FlowEvent> {
    let plan = flow.plan.as_ref()?;
    let blocked_goal = flow
        .goals_remaining()
        .into_iter()
        .find(|g| !goal_is_reachable(flow, plan, g));
    blocked_goal.map(|_| {
        let message = flow
            .executions
            .get(triggering_step)
            .and_then(|e| e.error.as_ref())
            .map(|e| e.message.clone())
            .unwrap_or_else(|| format!("step `{triggering_step}` no longer reachable to any goal"));
        FlowEvent::FlowFailed {
            error: FlowError {
                message,
                step_id: triggering_step.clone(),
                timestamp: now,
            },
        }
    })
}

/// Checks whether completing a goal step leaves any goals remaining;
/// raises `flow_completed` once none do (§4.5 "Termination").
fn check_completion_termination(flow: &FlowState, now: DateTime<Utc>) -> Option<FlowEvent> {
    if flow.plan.is_none() {
        return None;
    }
    if flow.goals_remaining().is_empty() {
        Some(FlowEvent::FlowCompleted { completed_at: now })
    } else {
        None
    }
}

/// Ties the pure decision functions above to a live event store and work
/// dispatcher to drive one flow forward.
pub struct FlowOrchestrator<S, D, M> {
    executor: Arc<EventExecutor<S>>,
    work_runner: Arc<WorkRunner<S, D, M>>,
}

impl<S, D, M> FlowOrchestrator<S, D, M>
where
    S: EventStore<FlowEvent> + EventStore<EngineEvent>,
    D: StepDispatcher,
    M: MemoCache,
{
    pub fn new(executor: Arc<EventExecutor<S>>, work_runner: Arc<WorkRunner<S, D, M>>) -> Self {
        Self { executor, work_runner }
    }

    async fn load(&self, flow_id: FlowId) -> Result<FlowState, OrchestratorError> {
        Ok(self
            .executor
            .exec_flow(flow_id, || FlowState::new(flow_id, Utc::now()), |_| Ok(vec![]))
            .await?)
    }

    /// One orchestration pass (§4.5): decides launches/skips, appends
    /// those events, then dispatches the launched steps' work items and
    /// appends whatever they immediately resolve to (memo hits, or a
    /// `work_started` record for work still in flight).
    #[instrument(skip(self), fields(flow_id = %flow_id))]
    pub async fn tick(&self, flow_id: FlowId, now: DateTime<Utc>) -> Result<FlowState, OrchestratorError> {
        let before = self.load(flow_id).await?;
        let decision = plan_launches(&before, now);
        if decision.events.is_empty() {
            return Ok(before);
        }

        self.executor
            .exec_flow(flow_id, || FlowState::new(flow_id, now), |state| {
                Ok(plan_launches(state, now).events)
            })
            .await?;

        for launch in &decision.launches {
            self.run_step(flow_id, launch, now).await?;
        }
        self.load(flow_id).await
    }

    async fn run_step(&self, flow_id: FlowId, launch: &Launch, now: DateTime<Utc>) -> Result<FlowState, OrchestratorError> {
        let state = self.load(flow_id).await?;
        let plan = state.plan.as_ref().expect("launch implies a plan");
        let step = plan.steps[&launch.step_id].clone();

        let work_items = bind_work_items(&step, &launch.resolved);
        let started_events: Vec<FlowEvent> = work_items
            .iter()
            .map(|w| FlowEvent::WorkStarted {
                step_id: step.id.clone(),
                token: w.token.clone(),
                inputs: w.inputs.clone(),
            })
            .collect();
        self.executor
            .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| Ok(started_events.clone()))
            .await?;

        let outcomes = self.work_runner.dispatch_all(flow_id, &step, work_items).await;
        self.record_outcomes(flow_id, &step, outcomes, now).await
    }

    /// Interprets dispatch outcomes into `work_succeeded`/`work_failed`/
    /// `retry_scheduled`, then, once the step's work is fully terminal,
    /// the aggregation and termination events (§4.6 steps 4-5, §4.5
    /// "Termination").
    pub async fn record_outcomes(
        &self,
        flow_id: FlowId,
        step: &Step,
        outcomes: Vec<(String, WorkOutcome)>,
        now: DateTime<Utc>,
    ) -> Result<FlowState, OrchestratorError> {
        let mut state = self.load(flow_id).await?;
        let mut events = Vec::new();
        for (token, outcome) in outcomes {
            let retry_count = state
                .executions
                .get(&step.id)
                .and_then(|e| e.work_items.get(&token))
                .map(|w| w.retry_count)
                .unwrap_or(0);
            events.extend(self.work_runner.interpret(step, &token, retry_count, outcome));
        }
        if events.is_empty() {
            return Ok(state);
        }

        state = self
            .executor
            .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| Ok(events.clone()))
            .await?;

        if step_work_is_terminal(&state, &step.id) {
            let finish_events = finish_step(&state, step, now);
            state = self
                .executor
                .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| Ok(finish_events.clone()))
                .await?;

            let terminal_events: Vec<FlowEvent> = if state
                .executions
                .get(&step.id)
                .map(|e| e.status == StepStatus::Failed)
                .unwrap_or(false)
            {
                check_failure_termination(&state, &step.id, now).into_iter().collect()
            } else {
                check_completion_termination(&state, now).into_iter().collect()
            };
            if !terminal_events.is_empty() {
                state = self
                    .executor
                    .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| Ok(terminal_events.clone()))
                    .await?;
            }
        }

        Ok(state)
    }

    /// Resolves an `async` step's work item from an external webhook
    /// payload (§9 "Coroutine/callback async steps"): the payload is
    /// modeled as a message into the flow aggregate keyed by
    /// `receipt_token`, turned into `work_succeeded`/`work_failed` via the
    /// same [`record_outcomes`](Self::record_outcomes) path dispatch
    /// outcomes already use.
    #[instrument(skip(self, response))]
    pub async fn handle_webhook(
        &self,
        receipt_token: &str,
        response: DispatchResponse,
        now: DateTime<Utc>,
    ) -> Result<FlowState, OrchestratorError> {
        let (flow_id, step_id, token) = parse_receipt_token(receipt_token)
            .map_err(|err| OrchestratorError::InvalidReceiptToken(err.to_string()))?;

        let state = self.load(flow_id).await?;
        let plan = state.plan.as_ref().ok_or_else(|| OrchestratorError::UnknownStep(step_id.clone()))?;
        let step = plan
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownStep(step_id.clone()))?;

        let outcome = if response.success {
            WorkOutcome::Succeeded {
                outputs: response.outputs.unwrap_or_default(),
            }
        } else {
            WorkOutcome::Permanent {
                error: WorkError::new(
                    response.error.unwrap_or_else(|| "webhook reported failure".to_string()),
                    false,
                ),
            }
        };

        self.record_outcomes(flow_id, &step, vec![(token, outcome)], now).await
    }

    /// Re-dispatches every work item the retry scheduler finds due
    /// (§4.8): one fresh `work_started` per item, grouped by step, then
    /// dispatch and the usual outcome interpretation.
    #[instrument(skip(self), fields(flow_id = %flow_id))]
    pub async fn retry_due(&self, flow_id: FlowId, now: DateTime<Utc>) -> Result<FlowState, OrchestratorError> {
        let mut state = self.load(flow_id).await?;
        let due = due_retries(&state, now);
        if due.is_empty() {
            return Ok(state);
        }
        let plan = state.plan.clone().expect("due retries imply a plan");

        let mut by_step: BTreeMap<StepId, Vec<Token>> = BTreeMap::new();
        for (step_id, token) in due {
            by_step.entry(step_id).or_default().push(token);
        }

        for (step_id, mut tokens) in by_step {
            tokens.sort();
            let step = plan.steps[&step_id].clone();
            let exec = &state.executions[&step_id];

            let started_events: Vec<FlowEvent> = tokens
                .iter()
                .map(|t| FlowEvent::WorkStarted {
                    step_id: step_id.clone(),
                    token: t.clone(),
                    inputs: exec.work_items[t].inputs.clone(),
                })
                .collect();
            state = self
                .executor
                .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| Ok(started_events.clone()))
                .await?;

            let work_items: Vec<BoundWork> = tokens
                .iter()
                .map(|t| BoundWork {
                    token: t.clone(),
                    inputs: state.executions[&step_id].work_items[t].inputs.clone(),
                })
                .collect();
            let outcomes = self.work_runner.dispatch_all(flow_id, &step, work_items).await;
            state = self.record_outcomes(flow_id, &step, outcomes, now).await?;
        }

        Ok(state)
    }

    /// Applies a skip/failure's reachability fallout without any work
    /// dispatch involved — used by the retry scheduler and by direct
    /// `step_skipped` events raised from `plan_launches`.
    pub async fn reconcile_termination(&self, flow_id: FlowId, now: DateTime<Utc>) -> Result<FlowState, OrchestratorError> {
        let state = self.load(flow_id).await?;
        let Some(plan) = &state.plan else {
            return Ok(state);
        };
        let newly_terminal_failed = plan.steps.keys().find(|id| {
            matches!(
                state.executions.get(*id).map(|e| e.status),
                Some(StepStatus::Failed) | Some(StepStatus::Skipped)
            )
        });
        let Some(step_id) = newly_terminal_failed else {
            return Ok(state);
        };
        if let Some(event) = check_failure_termination(&state, step_id, now) {
            return Ok(self
                .executor
                .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| Ok(vec![event.clone()]))
                .await?);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attribute::AttributeValue;
    use crate::model::flow::ExecutionState;
    use crate::model::plan::Excluded;
    use crate::model::step::{AttributeType, HttpConfig, Role, StepType, WorkConfig};
    use std::time::Duration;

    fn http_step(id: &str, inputs: &[(&str, Role)], outputs: &[&str]) -> Step {
        let mut attributes = BTreeMap::new();
        for (name, role) in inputs {
            let spec = match role {
                Role::Required => AttributeSpec::required(AttributeType::String),
                _ => AttributeSpec::optional(AttributeType::String),
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

    fn flow_with_plan(plan: ExecutionPlan, init: &[(&str, Value)]) -> FlowState {
        let mut flow = FlowState::new(FlowId::nil(), Utc::now());
        flow.status = FlowStatus::Active;
        for step_id in plan.steps.keys() {
            flow.executions.insert(step_id.clone(), ExecutionState::pending());
        }
        for (name, value) in init {
            flow.attributes.insert(name.to_string(), AttributeValue::initial(value.clone()));
        }
        flow.plan = Some(plan);
        flow
    }

    #[test]
    fn runnable_step_with_no_inputs_launches_immediately() {
        let plan = ExecutionPlan {
            goals: vec!["A".to_string()],
            required: vec![],
            steps: BTreeMap::from([("A".to_string(), http_step("A", &[], &["x"]))]),
            attributes: BTreeMap::new(),
            excluded: None,
        };
        let flow = flow_with_plan(plan, &[]);
        let decision = plan_launches(&flow, Utc::now());
        assert_eq!(decision.launches.len(), 1);
        assert_eq!(decision.launches[0].step_id, "A");
    }

    #[test]
    fn step_waiting_on_unresolved_required_input_is_not_launched() {
        let plan = ExecutionPlan {
            goals: vec!["B".to_string()],
            required: vec![],
            steps: BTreeMap::from([
                ("A".to_string(), http_step("A", &[], &["x"])),
                ("B".to_string(), http_step("B", &[("x", Role::Required)], &["y"])),
            ]),
            attributes: BTreeMap::from([(
                "x".to_string(),
                AttributeEdges {
                    providers: vec!["A".to_string()],
                    consumers: vec!["B".to_string()],
                },
            )]),
            excluded: None,
        };
        let flow = flow_with_plan(plan, &[]);
        let decision = plan_launches(&flow, Utc::now());
        assert_eq!(decision.launches.len(), 1);
        assert_eq!(decision.launches[0].step_id, "A");
    }

    #[test]
    fn step_with_unreachable_required_input_is_skipped() {
        let plan = ExecutionPlan {
            goals: vec!["B".to_string()],
            required: vec![],
            steps: BTreeMap::from([
                ("A".to_string(), http_step("A", &[], &["x"])),
                ("B".to_string(), http_step("B", &[("x", Role::Required)], &["y"])),
            ]),
            attributes: BTreeMap::from([(
                "x".to_string(),
                AttributeEdges {
                    providers: vec!["A".to_string()],
                    consumers: vec!["B".to_string()],
                },
            )]),
            excluded: None,
        };
        let mut flow = flow_with_plan(plan, &[]);
        flow.executions.get_mut("A").unwrap().status = StepStatus::Failed;
        let decision = plan_launches(&flow, Utc::now());
        assert_eq!(decision.launches.len(), 0);
        assert!(matches!(
            &decision.events[0],
            FlowEvent::StepSkipped { step_id, .. } if step_id == "B"
        ));
    }

    #[test]
    fn predicate_false_skips_the_step() {
        let mut step = http_step("A", &[], &["x"]);
        step.predicate = Some("false".to_string());
        let plan = ExecutionPlan {
            goals: vec!["A".to_string()],
            required: vec![],
            steps: BTreeMap::from([("A".to_string(), step)]),
            attributes: BTreeMap::new(),
            excluded: None,
        };
        let flow = flow_with_plan(plan, &[]);
        let decision = plan_launches(&flow, Utc::now());
        assert_eq!(decision.launches.len(), 0);
        assert!(matches!(&decision.events[0], FlowEvent::StepSkipped { .. }));
    }

    #[test]
    fn optional_input_without_provider_never_blocks_launch() {
        let step = http_step("A", &[("opt", Role::Optional)], &["x"]);
        let plan = ExecutionPlan {
            goals: vec!["A".to_string()],
            required: vec![],
            steps: BTreeMap::from([("A".to_string(), step)]),
            attributes: BTreeMap::new(),
            excluded: None,
        };
        let flow = flow_with_plan(plan, &[]);
        let decision = plan_launches(&flow, Utc::now());
        assert_eq!(decision.launches.len(), 1);
        assert!(!decision.launches[0].resolved.contains_key("opt"));
    }

    #[test]
    fn optional_input_waits_for_active_provider_until_timeout() {
        let mut step = http_step("B", &[("opt", Role::Optional)], &["y"]);
        step.attributes.get_mut("opt").unwrap().timeout = Some(Duration::from_secs(10));
        let plan = ExecutionPlan {
            goals: vec!["B".to_string()],
            required: vec![],
            steps: BTreeMap::from([
                ("A".to_string(), http_step("A", &[], &["opt"])),
                ("B".to_string(), step),
            ]),
            attributes: BTreeMap::from([(
                "opt".to_string(),
                AttributeEdges {
                    providers: vec!["A".to_string()],
                    consumers: vec!["B".to_string()],
                },
            )]),
            excluded: None,
        };
        let mut flow = flow_with_plan(plan, &[]);
        let now = Utc::now();
        flow.executions.get_mut("A").unwrap().status = StepStatus::Active;
        flow.executions.get_mut("A").unwrap().started_at = Some(now - ChronoDuration::seconds(1));

        let still_waiting = plan_launches(&flow, now);
        assert!(still_waiting.launches.iter().all(|l| l.step_id != "B"));

        let past_timeout = plan_launches(&flow, now + ChronoDuration::seconds(20));
        assert!(past_timeout.launches.iter().any(|l| l.step_id == "B"));
    }

    #[test]
    fn goal_completion_with_no_remaining_goals_completes_flow() {
        let plan = ExecutionPlan {
            goals: vec!["A".to_string()],
            required: vec![],
            steps: BTreeMap::from([("A".to_string(), http_step("A", &[], &["x"]))]),
            attributes: BTreeMap::new(),
            excluded: None,
        };
        let mut flow = flow_with_plan(plan, &[]);
        flow.executions.get_mut("A").unwrap().status = StepStatus::Completed;
        let event = check_completion_termination(&flow, Utc::now());
        assert!(matches!(event, Some(FlowEvent::FlowCompleted { .. })));
    }

    #[test]
    fn failed_step_blocking_the_only_goal_fails_the_flow() {
        let plan = ExecutionPlan {
            goals: vec!["B".to_string()],
            required: vec![],
            steps: BTreeMap::from([
                ("A".to_string(), http_step("A", &[], &["x"])),
                ("B".to_string(), http_step("B", &[("x", Role::Required)], &["y"])),
            ]),
            attributes: BTreeMap::from([(
                "x".to_string(),
                AttributeEdges {
                    providers: vec!["A".to_string()],
                    consumers: vec!["B".to_string()],
                },
            )]),
            excluded: None,
        };
        let mut flow = flow_with_plan(plan, &[]);
        flow.executions.get_mut("A").unwrap().status = StepStatus::Failed;
        let event = check_failure_termination(&flow, &"A".to_string(), Utc::now());
        assert!(matches!(event, Some(FlowEvent::FlowFailed { .. })));
    }

    #[test]
    fn failed_step_with_alternate_path_to_goal_does_not_fail_flow() {
        let plan = ExecutionPlan {
            goals: vec!["C".to_string()],
            required: vec![],
            steps: BTreeMap::from([
                ("A".to_string(), http_step("A", &[], &["x"])),
                ("B".to_string(), http_step("B", &[], &["x"])),
                ("C".to_string(), http_step("C", &[("x", Role::Required)], &["y"])),
            ]),
            attributes: BTreeMap::from([(
                "x".to_string(),
                AttributeEdges {
                    providers: vec!["A".to_string(), "B".to_string()],
                    consumers: vec!["C".to_string()],
                },
            )]),
            excluded: None,
        };
        let mut flow = flow_with_plan(plan, &[]);
        flow.executions.get_mut("A").unwrap().status = StepStatus::Failed;
        let event = check_failure_termination(&flow, &"A".to_string(), Utc::now());
        assert!(event.is_none());
    }

    #[test]
    fn satisfied_goal_excluded_from_plan_needs_no_launch() {
        let plan = ExecutionPlan {
            goals: vec!["B".to_string()],
            required: vec![],
            steps: BTreeMap::new(),
            attributes: BTreeMap::new(),
            excluded: Some(Excluded {
                satisfied: BTreeMap::from([("B".to_string(), vec!["y".to_string()])]),
                missing: BTreeMap::new(),
            }),
        };
        let flow = flow_with_plan(plan, &[("y", Value::String("v".into()))]);
        let decision = plan_launches(&flow, Utc::now());
        assert!(decision.launches.is_empty());
        assert!(decision.events.is_empty());
    }

    #[tokio::test]
    async fn retry_due_redispatches_and_eventually_completes_the_step() {
        use crate::memo::LruMemoCache;
        use crate::persistence::InMemoryEventStore;
        use crate::work::{DispatchError, ScriptedDispatcher};

        let mut step = http_step("A", &[], &["x"]);
        step.work_config.max_retries = 1;
        let plan = ExecutionPlan {
            goals: vec!["A".to_string()],
            required: vec![],
            steps: BTreeMap::from([("A".to_string(), step)]),
            attributes: BTreeMap::new(),
            excluded: None,
        };

        let dispatcher = Arc::new(ScriptedDispatcher::new());
        dispatcher.program("A", Err(DispatchError::Transport("boom".into())));
        dispatcher.program(
            "A",
            Ok(BTreeMap::from([("x".to_string(), Value::String("ra".into()))])),
        );
        let hub = Arc::new(crate::bus::InMemoryEventHub::new());
        let executor = Arc::new(EventExecutor::new(InMemoryEventStore::new()).with_flow_hub(hub.clone()));
        let work_runner = Arc::new(WorkRunner::new(executor.clone(), hub, dispatcher, Arc::new(LruMemoCache::new(16))));
        let orchestrator = FlowOrchestrator::new(executor, work_runner);

        let flow_id = FlowId::nil();
        let now = Utc::now();
        orchestrator
            .executor
            .exec_flow(flow_id, || FlowState::new(flow_id, now), |_| {
                Ok(vec![FlowEvent::FlowStarted {
                    plan: plan.clone(),
                    init: BTreeMap::new(),
                }])
            })
            .await
            .unwrap();

        let state = orchestrator.tick(flow_id, now).await.unwrap();
        let work = &state.executions["A"].work_items["t0"];
        assert_eq!(work.status, WorkStatus::Pending);
        assert!(work.next_retry_at.is_some());

        let after = work.next_retry_at.unwrap() + ChronoDuration::milliseconds(1);
        let state = orchestrator.retry_due(flow_id, after).await.unwrap();
        assert_eq!(state.executions["A"].status, StepStatus::Completed);
        assert_eq!(state.status, FlowStatus::Completed);
    }
}
