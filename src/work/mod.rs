//! Work Runner: input binding, memoization, dispatch, retry scheduling
//! (§4.6, §4.8).

pub mod dispatch;
pub mod retry;
pub mod runner;
pub mod scheduler;

pub use dispatch::{
    build_receipt_token, parse_receipt_token, DispatchError, DispatchMetadata, DispatchRequest,
    DispatchResponse, ScriptedDispatcher, StepDispatcher,
};
pub use retry::backoff_for_attempt;
pub use runner::{bind_work_items, unresolved_inputs, BoundWork, WorkOutcome, WorkRunner, WorkerPoolConfig};
pub use scheduler::{due_retries, RetryScheduler, RetrySchedulerConfig};
