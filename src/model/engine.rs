//! Engine aggregate state (§3 `EngineState`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::flow::FlowId;
use super::step::{Step, StepId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl StepHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            error: Some(error.into()),
        }
    }
}

/// The engine aggregate: the step catalog, per-step health, and the
/// active/deactivated/archiving flow partition (§3 invariant: the three
/// sets are pairwise disjoint).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineState {
    pub catalog: BTreeMap<StepId, Step>,
    pub health: BTreeMap<StepId, StepHealth>,
    pub active: BTreeSet<FlowId>,
    pub deactivated: BTreeSet<FlowId>,
    pub archiving: BTreeSet<FlowId>,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which of the three disjoint sets (if any) a flow currently belongs
    /// to.
    pub fn flow_set_membership(&self, flow_id: FlowId) -> Option<&'static str> {
        if self.active.contains(&flow_id) {
            Some("active")
        } else if self.deactivated.contains(&flow_id) {
            Some("deactivated")
        } else if self.archiving.contains(&flow_id) {
            Some("archiving")
        } else {
            None
        }
    }
}
