//! Error taxonomy shared across components (§7).

use thiserror::Error;

use crate::model::step::StepId;
use crate::model::work::Token;

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("invalid step transition for {step_id}")]
    InvalidStepTransition { step_id: StepId },

    #[error("invalid work transition for {step_id}/{token}")]
    InvalidWorkTransition { step_id: StepId, token: Token },

    #[error("step {0} is not part of the flow's plan")]
    StepNotInPlan(StepId),

    #[error("work item {step_id}/{token} not found")]
    WorkItemNotFound { step_id: StepId, token: Token },
}

#[derive(Debug, Error, PartialEq)]
pub enum ExecutionError {
    #[error("work item failed permanently: {0}")]
    WorkPermanent(String),

    #[error("work item failed retryably: {0}")]
    WorkRetryable(String),

    #[error("sub-flow failed: {0}")]
    SubFlowFailed(String),

    #[error("predicate evaluation failed: {0}")]
    PredicateEvaluation(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConcurrencyError {
    #[error("optimistic concurrency retries exhausted for {key} after {attempts} attempts")]
    OptimisticConflictExhausted { key: String, attempts: u32 },
}
