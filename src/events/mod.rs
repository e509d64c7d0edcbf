//! Event payloads for the two append-only aggregates (§4.2).
//!
//! Events are immutable once written; state is reconstructed by replaying
//! a stream in order. Flow events and engine events are disjoint enums
//! dispatched at separate aggregate keys (§6 "Keys are structured IDs
//! (`[\"engine\"]`, `[\"flow\", flowID]`)").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::attribute::Name;
use crate::model::flow::FlowError as FlowTerminalError;
use crate::model::flow::FlowId;
use crate::model::plan::ExecutionPlan;
use crate::model::step::{Step, StepId};
use crate::model::work::{Token, WorkError};

/// Events raised against the `FlowState` aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// The plan is computed by the `start_flow` command handler (a pure
    /// function of goals/init/catalog) and carried in full so the reducer
    /// stays a pure function of `(state, event)` with no external lookup.
    FlowStarted {
        plan: ExecutionPlan,
        init: std::collections::BTreeMap<Name, Value>,
    },

    /// Raised alongside `FlowStarted` when this flow is a sub-flow spawned
    /// by a parent step (§9 "Sub-flow composition"). Carried for audit
    /// only; no parent/child direct references are retained elsewhere.
    ChildFlowLinked {
        parent_flow_id: FlowId,
        parent_step_id: StepId,
        parent_token: Token,
    },

    AttributeSet {
        name: Name,
        value: Value,
        step: StepId,
    },

    StepStarted {
        step_id: StepId,
        started_at: DateTime<Utc>,
    },

    StepCompleted {
        step_id: StepId,
        outputs: std::collections::BTreeMap<Name, Vec<Value>>,
        completed_at: DateTime<Utc>,
    },

    StepSkipped {
        step_id: StepId,
        reason: String,
    },

    StepFailed {
        step_id: StepId,
        error: WorkError,
    },

    WorkStarted {
        step_id: StepId,
        token: Token,
        inputs: std::collections::BTreeMap<Name, Value>,
    },

    WorkSucceeded {
        step_id: StepId,
        token: Token,
        outputs: std::collections::BTreeMap<Name, Value>,
    },

    WorkFailed {
        step_id: StepId,
        token: Token,
        error: WorkError,
    },

    RetryScheduled {
        step_id: StepId,
        token: Token,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },

    FlowCompleted {
        completed_at: DateTime<Utc>,
    },

    FlowFailed {
        error: FlowTerminalError,
    },

    FlowStopped {
        reason: String,
    },
}

/// Events raised against the `EngineState` aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StepRegistered {
        step: Step,
    },

    StepUpdated {
        step: Step,
    },

    StepRemoved {
        step_id: StepId,
    },

    StepHealthChanged {
        step_id: StepId,
        status: crate::model::engine::HealthStatus,
        error: Option<String>,
    },

    FlowActivated {
        flow_id: FlowId,
    },

    FlowDeactivated {
        flow_id: FlowId,
    },

    FlowArchiving {
        flow_id: FlowId,
    },
}

/// Envelope wrapping a raised event with its aggregate metadata, matching
/// §4.1 "Events carry `{Type, Timestamp, AggregateID, Data}`".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<E> {
    pub aggregate_id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub data: E,
}

impl<E> Envelope<E> {
    pub fn new(aggregate_id: impl Into<String>, sequence: u64, data: E) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            timestamp: Utc::now(),
            sequence,
            data,
        }
    }
}
