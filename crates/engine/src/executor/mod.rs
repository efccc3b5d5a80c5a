//! Execution: the per-runnable run state machine and the backend that executes jobs.
//!
//! - `coordinator::Coordinator` decides which run may start and which results are current
//! - `runner::ExecutionBackend` abstracts how a job is dispatched and awaited
//! - `runner::NoopBackend` echoes inputs for tests, previews and the CLI

pub mod coordinator;
pub mod runner;

pub use coordinator::{
    ActiveRun, CompletionVerdict, Coordinator, RunId, RunOutcome, RunState, StartedRun, Transition, TriggerCause, TriggerDecision,
};
pub use runner::{DispatchRequest, ExecutionBackend, JobCompletion, JobTicket, NoopBackend};
