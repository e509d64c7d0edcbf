//! Work-item state (§3 `WorkState`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attribute::Name;

/// Opaque unique token identifying one work item within a step's
/// execution. For non-`for_each` steps there is exactly one token.
pub type Token = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    NotCompleted,
}

impl WorkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::NotCompleted)
    }
}

/// An error recorded against a work item or flow, with enough context to
/// audit without re-reading the full event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkError {
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl WorkError {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
            timestamp: Utc::now(),
        }
    }
}

/// One invocation of a step handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkState {
    pub token: Token,
    pub status: WorkStatus,
    pub inputs: std::collections::BTreeMap<Name, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outputs: Option<std::collections::BTreeMap<Name, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<WorkError>,

    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// One entry per failed attempt, oldest first. Supplements the spec's
    /// `WorkState.Error` (which holds only the latest) so the full retry
    /// trail is visible without replaying the event log.
    #[serde(default)]
    pub error_history: Vec<WorkError>,
}

impl WorkState {
    pub fn new(token: Token, inputs: std::collections::BTreeMap<Name, serde_json::Value>) -> Self {
        Self {
            token,
            status: WorkStatus::Pending,
            inputs,
            outputs: None,
            error: None,
            retry_count: 0,
            next_retry_at: None,
            error_history: Vec::new(),
        }
    }
}
