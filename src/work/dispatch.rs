//! Step handler dispatch: the wire contract of §6 plus the sub-flow and
//! script variants, behind one trait so the Work Runner stays ignorant of
//! transport (§4.6 step 3).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::attribute::Name;
use crate::model::flow::FlowId;
use crate::model::step::StepId;
use crate::model::work::Token;

/// Request envelope posted to a step handler (§6 "Step handler wire
/// format").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMetadata {
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub receipt_token: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub arguments: BTreeMap<Name, Value>,
    pub metadata: DispatchMetadata,
}

/// Response body, shared by sync replies and webhook rendezvous (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outputs: Option<BTreeMap<Name, Value>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Result-interpretation categories (§4.6 step 4).
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("handler timed out")]
    Timeout,

    #[error("handler returned success=false: {0}")]
    PermanentFailure(String),

    #[error("handler returned a non-retryable error status: {0}")]
    ClientError(String),

    #[error("sub-flow failed: {0}")]
    SubFlowFailed(String),
}

impl DispatchError {
    /// §4.6 step 4: network failure, timeout, or 5xx are retryable;
    /// everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Builds a self-describing `receipt_token`: the flow id, step id, and work
/// token an external webhook payload needs to resolve back to a
/// `work_succeeded`/`work_failed` command, plus a random suffix so the
/// token can't be guessed (§9 "the receipt token is the correlation
/// handle" — no side table of outstanding receipts is kept, so the token
/// itself must carry what `parse_receipt_token` needs). Step ids and work
/// tokens in this crate never contain `.`.
pub fn build_receipt_token(flow_id: FlowId, step_id: &str, token: &str) -> String {
    format!("{flow_id}.{step_id}.{token}.{}", Uuid::now_v7())
}

/// Inverse of [`build_receipt_token`]; the trailing nonce is only for
/// unguessability and is discarded here.
pub fn parse_receipt_token(receipt_token: &str) -> Result<(FlowId, StepId, Token), DispatchError> {
    let mut parts = receipt_token.splitn(4, '.');
    let flow_id = parts
        .next()
        .ok_or_else(|| DispatchError::ClientError("receipt token missing flow id".to_string()))?;
    let step_id = parts
        .next()
        .ok_or_else(|| DispatchError::ClientError("receipt token missing step id".to_string()))?;
    let token = parts
        .next()
        .ok_or_else(|| DispatchError::ClientError("receipt token missing work token".to_string()))?;
    let flow_id = FlowId::parse_str(flow_id)
        .map_err(|err| DispatchError::ClientError(format!("invalid flow id in receipt token: {err}")))?;
    Ok((flow_id, step_id.to_string(), token.to_string()))
}

/// One step handler invocation. Implementations cover `sync`/`async` HTTP,
/// in-process `script`, and `flow` sub-flow dispatch.
#[async_trait]
pub trait StepDispatcher: Send + Sync + 'static {
    /// Dispatches one work item and resolves once its result is known:
    /// immediately for sync HTTP and script, after webhook rendezvous for
    /// async HTTP, after child-flow completion for sub-flows.
    async fn dispatch(
        &self,
        request: DispatchRequest,
        timeout: Duration,
    ) -> Result<BTreeMap<Name, Value>, DispatchError>;
}

/// Deterministic in-memory dispatcher for tests: returns a
/// pre-programmed outcome per step id, optionally after N failures.
pub struct ScriptedDispatcher {
    outcomes: parking_lot::Mutex<BTreeMap<StepId, Vec<Result<BTreeMap<Name, Value>, DispatchError>>>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self {
            outcomes: parking_lot::Mutex::new(BTreeMap::new()),
        }
    }

    /// Queues one outcome per call to `dispatch` for `step_id`, consumed
    /// in order (oldest first).
    pub fn program(&self, step_id: impl Into<StepId>, outcome: Result<BTreeMap<Name, Value>, DispatchError>) {
        self.outcomes
            .lock()
            .entry(step_id.into())
            .or_default()
            .push(outcome);
    }
}

impl Default for ScriptedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        request: DispatchRequest,
        _timeout: Duration,
    ) -> Result<BTreeMap<Name, Value>, DispatchError> {
        let mut outcomes = self.outcomes.lock();
        let queue = outcomes
            .get_mut(&request.metadata.step_id)
            .ok_or_else(|| DispatchError::Transport("no scripted outcome".to_string()))?;
        if queue.is_empty() {
            return Err(DispatchError::Transport("scripted outcomes exhausted".to_string()));
        }
        queue.remove(0)
    }
}
