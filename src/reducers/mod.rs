//! Pure `(state, event) -> state` projections for the two aggregates
//! (§4.2). No I/O, no panics on well-formed input; replaying a stream
//! through these functions must reconstruct state bit-identical to live
//! (§8 "Replay determinism").

use crate::events::{EngineEvent, FlowEvent};
use crate::model::attribute::AttributeValue;
use crate::model::engine::{EngineState, StepHealth};
use crate::model::flow::{ExecutionState, FlowState, FlowStatus, ParentRef, StepStatus};
use crate::model::work::{WorkState, WorkStatus};

/// Applies one `FlowEvent` to a `FlowState`, returning the updated state.
pub fn flow_reducer(mut state: FlowState, event: &FlowEvent) -> FlowState {
    match event {
        FlowEvent::FlowStarted { plan, init } => {
            state.status = FlowStatus::Active;
            for (name, value) in init {
                state
                    .attributes
                    .entry(name.clone())
                    .or_insert_with(|| AttributeValue::initial(value.clone()));
            }
            for step_id in plan.steps.keys() {
                state
                    .executions
                    .entry(step_id.clone())
                    .or_insert_with(ExecutionState::pending);
            }
            state.plan = Some(plan.clone());
        }

        FlowEvent::ChildFlowLinked {
            parent_flow_id,
            parent_step_id,
            parent_token,
        } => {
            state.parent.get_or_insert(ParentRef {
                flow_id: *parent_flow_id,
                step_id: parent_step_id.clone(),
                token: parent_token.clone(),
            });
        }

        FlowEvent::AttributeSet { name, value, step } => {
            // First-writer-wins: the event is appended for audit even when
            // a value is already present, but the reducer ignores it.
            state
                .attributes
                .entry(name.clone())
                .or_insert_with(|| AttributeValue::produced_by(value.clone(), step.clone()));
        }

        FlowEvent::StepStarted { step_id, started_at } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                exec.status = StepStatus::Active;
                exec.started_at = Some(*started_at);
            }
        }

        FlowEvent::StepCompleted {
            step_id,
            outputs,
            completed_at,
        } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                exec.status = StepStatus::Completed;
                exec.outputs = Some(outputs.clone());
                exec.completed_at = Some(*completed_at);
                exec.duration_ms = exec
                    .started_at
                    .map(|s| (*completed_at - s).num_milliseconds());
            }
        }

        FlowEvent::StepSkipped { step_id, .. } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                exec.status = StepStatus::Skipped;
            }
        }

        FlowEvent::StepFailed { step_id, error } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                exec.status = StepStatus::Failed;
                exec.error = Some(error.clone());
            }
        }

        FlowEvent::WorkStarted {
            step_id,
            token,
            inputs,
        } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                let work = exec
                    .work_items
                    .entry(token.clone())
                    .or_insert_with(|| WorkState::new(token.clone(), inputs.clone()));
                work.status = WorkStatus::Active;
            }
        }

        FlowEvent::WorkSucceeded {
            step_id,
            token,
            outputs,
        } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::Succeeded;
                    work.outputs = Some(outputs.clone());
                }
            }
        }

        FlowEvent::WorkFailed {
            step_id,
            token,
            error,
        } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::Failed;
                    work.error = Some(error.clone());
                    work.error_history.push(error.clone());
                }
            }
        }

        FlowEvent::RetryScheduled {
            step_id,
            token,
            retry_count,
            next_retry_at,
        } => {
            if let Some(exec) = state.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    if let Some(prev_error) = work.error.take() {
                        work.error_history.push(prev_error);
                    }
                    work.status = WorkStatus::Pending;
                    work.retry_count = *retry_count;
                    work.next_retry_at = Some(*next_retry_at);
                }
            }
        }

        FlowEvent::FlowCompleted { completed_at } => {
            if !state.status.is_terminal() {
                state.status = FlowStatus::Completed;
                state.completed_at = Some(*completed_at);
            }
        }

        FlowEvent::FlowFailed { error } => {
            if !state.status.is_terminal() {
                state.status = FlowStatus::Failed;
                state.completed_at = Some(error.timestamp);
                state.error = Some(error.clone());
            }
        }

        FlowEvent::FlowStopped { .. } => {
            if !state.status.is_terminal() {
                state.status = FlowStatus::Stopped;
            }
        }
    }

    state
}

/// Applies one `EngineEvent` to an `EngineState`.
pub fn engine_reducer(mut state: EngineState, event: &EngineEvent) -> EngineState {
    match event {
        EngineEvent::StepRegistered { step } | EngineEvent::StepUpdated { step } => {
            state.catalog.insert(step.id.clone(), step.clone());
        }

        EngineEvent::StepRemoved { step_id } => {
            state.catalog.remove(step_id);
            state.health.remove(step_id);
        }

        EngineEvent::StepHealthChanged {
            step_id,
            status,
            error,
        } => {
            state.health.insert(
                step_id.clone(),
                StepHealth {
                    status: status.clone(),
                    error: error.clone(),
                },
            );
        }

        EngineEvent::FlowActivated { flow_id } => {
            state.deactivated.remove(flow_id);
            state.archiving.remove(flow_id);
            state.active.insert(*flow_id);
        }

        EngineEvent::FlowDeactivated { flow_id } => {
            state.active.remove(flow_id);
            state.archiving.remove(flow_id);
            state.deactivated.insert(*flow_id);
        }

        EngineEvent::FlowArchiving { flow_id } => {
            state.active.remove(flow_id);
            state.deactivated.remove(flow_id);
            state.archiving.insert(*flow_id);
        }
    }

    state
}

/// `true` iff applying `event` would be a no-op, used to enforce
/// idempotent health reporting (§4.7, §8 "Idempotent health") before the
/// caller raises the event at all.
pub fn is_redundant_health_change(
    state: &EngineState,
    step_id: &str,
    status: &crate::model::engine::HealthStatus,
) -> bool {
    state
        .health
        .get(step_id)
        .map(|h| &h.status == status)
        .unwrap_or(false)
}
