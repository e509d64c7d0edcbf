//! Step catalog entries
//!
//! A [`Step`] is the unit the planner reasons about and the orchestrator
//! dispatches. Catalog identity for memoization deliberately excludes
//! `name`, `id` and `labels` — see [`crate::memo`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unique identifier for a catalog step.
pub type StepId = String;

/// Attribute name, used both as a key into `FlowState::attributes` and as
/// a key into a step's declared `attributes` map.
pub type Name = String;

/// Role an attribute plays for a given step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Required,
    Optional,
    Const,
    Output,
}

/// Declared type of an attribute value, used for validation at the
/// catalog/registration boundary (not enforced on arbitrary JSON at
/// runtime beyond this).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

/// One attribute declaration on a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeSpec {
    pub role: Role,
    pub attribute_type: AttributeType,

    /// Default value used when an optional input's timeout expires before
    /// the attribute resolves. Never materialized into `FlowState.Attributes`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default: Option<serde_json::Value>,

    /// Mapping hint for sub-flow input/output wiring (unused on non-`flow`
    /// steps).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mapping: Option<String>,

    /// When set, this input fans the step out into one work item per
    /// element of the (array-typed) attribute value.
    #[serde(default)]
    pub for_each: bool,

    /// Cooperative timeout for an unresolved optional input, starting when
    /// the first upstream provider enters `active`.
    #[serde(with = "option_duration_millis", default)]
    pub timeout: Option<Duration>,
}

impl AttributeSpec {
    pub fn required(attribute_type: AttributeType) -> Self {
        Self {
            role: Role::Required,
            attribute_type,
            default: None,
            mapping: None,
            for_each: false,
            timeout: None,
        }
    }

    pub fn optional(attribute_type: AttributeType) -> Self {
        Self {
            role: Role::Optional,
            attribute_type,
            default: None,
            mapping: None,
            for_each: false,
            timeout: None,
        }
    }

    pub fn output(attribute_type: AttributeType) -> Self {
        Self {
            role: Role::Output,
            attribute_type,
            default: None,
            mapping: None,
            for_each: false,
            timeout: None,
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_for_each(mut self) -> Self {
        self.for_each = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Step variant and its execution-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    Sync { http: HttpConfig },
    Async { http: HttpConfig },
    Script { script: ScriptConfig },
    Flow { flow: FlowConfig },
}

/// Configuration for `sync`/`async` HTTP-backed steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    pub endpoint: String,

    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

/// Interpreter variants for in-process `script` steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptInterpreter {
    Ale,
    Lua,
}

/// Configuration for `script` steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptConfig {
    pub interpreter: ScriptInterpreter,
    pub source: String,
}

/// Configuration for `flow` (sub-flow) steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowConfig {
    pub goals: Vec<StepId>,

    /// Maps this step's bound inputs onto the child flow's initial
    /// attribute set.
    pub input_map: BTreeMap<Name, Name>,

    /// Maps the child flow's resolved attributes onto this work item's
    /// output names.
    pub output_map: BTreeMap<Name, Name>,
}

/// Backoff shape for work item retries. See [`crate::work::retry`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Linear,
    Exponential,
}

/// Per-step work execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkConfig {
    pub max_retries: u32,
    pub backoff_type: BackoffType,

    #[serde(with = "duration_millis")]
    pub backoff: Duration,

    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Maximum number of this step's work items dispatched concurrently.
    pub parallelism: usize,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_type: BackoffType::Fixed,
            backoff: Duration::from_millis(0),
            max_backoff: Duration::from_secs(60),
            parallelism: 1,
        }
    }
}

/// A step as registered in the engine catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub name: String,

    #[serde(flatten)]
    pub step_type: StepType,

    pub attributes: BTreeMap<Name, AttributeSpec>,

    /// Predicate expression evaluated against current flow attributes;
    /// absence means the step always runs once its inputs resolve.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub predicate: Option<String>,

    pub work_config: WorkConfig,

    #[serde(default)]
    pub memoizable: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Step {
    /// Attributes with the given role, sorted by name for deterministic
    /// iteration (§4.3 tie-break rule).
    pub fn attributes_with_role(&self, role: Role) -> Vec<&Name> {
        let mut names: Vec<&Name> = self
            .attributes
            .iter()
            .filter(|(_, spec)| spec.role == role)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    pub fn required_inputs(&self) -> Vec<&Name> {
        self.attributes_with_role(Role::Required)
    }

    pub fn optional_inputs(&self) -> Vec<&Name> {
        self.attributes_with_role(Role::Optional)
    }

    pub fn outputs(&self) -> Vec<&Name> {
        self.attributes_with_role(Role::Output)
    }

    pub fn has_for_each_input(&self) -> bool {
        self.attributes.values().any(|spec| spec.for_each)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
