//! Attribute values and provenance.

use serde::{Deserialize, Serialize};

use super::step::{Name, StepId};

/// A value stored in a flow's attribute map, carrying producer provenance.
///
/// `step` is absent for values supplied in the flow's initial attribute
/// set; once set by an event, provenance is append-once (§3 invariant
/// "first producer wins").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeValue {
    pub value: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub step: Option<StepId>,
}

impl AttributeValue {
    pub fn initial(value: serde_json::Value) -> Self {
        Self { value, step: None }
    }

    pub fn produced_by(value: serde_json::Value, step: StepId) -> Self {
        Self {
            value,
            step: Some(step),
        }
    }
}

/// Providers and consumers recorded for one attribute name in an
/// accepted plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AttributeEdges {
    pub providers: Vec<StepId>,
    pub consumers: Vec<StepId>,
}

pub type AttributeMap = std::collections::BTreeMap<Name, AttributeValue>;
