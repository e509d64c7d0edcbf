//! Flow and per-step execution state (§3 `FlowState`, `ExecutionState`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attribute::{AttributeMap, Name};
use super::plan::ExecutionPlan;
use super::step::StepId;
use super::work::{Token, WorkError, WorkState};

/// Audit-only back-pointer from a sub-flow to the parent step that spawned
/// it (§9 "Sub-flow composition" — "no parent/child direct references are
/// stored" beyond this linkage).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentRef {
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub token: Token,
}

pub type FlowId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Stopped,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

/// Per-step execution record within a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionState {
    pub status: StepStatus,
    pub inputs: BTreeMap<Name, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outputs: Option<BTreeMap<Name, Vec<serde_json::Value>>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<WorkError>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<i64>,

    pub work_items: BTreeMap<Token, WorkState>,
}

impl ExecutionState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            inputs: BTreeMap::new(),
            outputs: None,
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            work_items: BTreeMap::new(),
        }
    }
}

/// Terminal flow-level error, per §7 "A running flow that fails reports
/// `Error = {message, step_id, timestamp}`".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowError {
    pub message: String,
    pub step_id: StepId,
    pub timestamp: DateTime<Utc>,
}

/// The flow aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowState {
    pub id: FlowId,
    pub status: FlowStatus,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plan: Option<ExecutionPlan>,

    pub attributes: AttributeMap,
    pub executions: BTreeMap<StepId, ExecutionState>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<FlowError>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<ParentRef>,
}

impl FlowState {
    pub fn new(id: FlowId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: FlowStatus::Pending,
            plan: None,
            attributes: AttributeMap::new(),
            executions: BTreeMap::new(),
            created_at,
            completed_at: None,
            error: None,
            parent: None,
        }
    }

    /// Goals not yet completed, derived from the plan and current
    /// per-step execution status (§4.5 `GoalsRemaining`).
    pub fn goals_remaining(&self) -> Vec<StepId> {
        let Some(plan) = &self.plan else {
            return Vec::new();
        };
        plan.goals
            .iter()
            .filter(|g| {
                !matches!(
                    self.executions.get(*g).map(|e| e.status),
                    Some(StepStatus::Completed)
                )
            })
            .cloned()
            .collect()
    }

    /// True once every plan step and every work item within it is in a
    /// terminal status (§4.7 "quiescent").
    pub fn is_quiescent(&self) -> bool {
        self.executions.values().all(|exec| {
            exec.status.is_terminal()
                && exec
                    .work_items
                    .values()
                    .all(|w| w.status.is_terminal())
        })
    }
}
