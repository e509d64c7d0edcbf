//! The immutable execution plan produced by the planner (§3, §4.3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::attribute::AttributeEdges;
use super::step::{Name, Step, StepId};

/// Bookkeeping explaining why a step was omitted from the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Excluded {
    /// Goal steps whose outputs were entirely present in the initial
    /// attribute set, keyed by step, with the satisfied attribute names.
    pub satisfied: BTreeMap<StepId, Vec<Name>>,

    /// Steps pruned from the closure because a required input had no
    /// reachable producer, keyed by step, with the missing names.
    pub missing: BTreeMap<StepId, Vec<Name>>,
}

/// The frozen, acyclic plan attached to a flow once computed.
///
/// `steps` is the closure of `goals` under attribute dependency (§3); the
/// induced provider→consumer graph is guaranteed acyclic by the planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub goals: Vec<StepId>,

    /// Launch-time inputs the flow must supply in its initial attribute
    /// set; none of these are produced by any included step.
    pub required: Vec<Name>,

    pub steps: BTreeMap<StepId, Step>,

    pub attributes: BTreeMap<Name, AttributeEdges>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub excluded: Option<Excluded>,
}

impl ExecutionPlan {
    pub fn contains_step(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }
}
