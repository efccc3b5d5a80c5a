//! Error taxonomy of the engine.
//!
//! None of these are fatal to a session: warnings and dangling references are surfaced to the
//! editor, execution errors are recorded per component, and late results of superseded runs
//! are discarded.

use std::fmt;

use runboard_types::JobId;
use serde::Serialize;
use thiserror::Error;

/// Malformed binding found while resolving a runnable's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionWarning {
    pub runnable: String,
    /// Dotted location of the field, for example `fields.source.x.query`.
    pub field: String,
    pub message: String,
}

impl ResolutionWarning {
    pub fn new(runnable: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            runnable: runnable.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} ({}): {}", self.runnable, self.field, self.message)
    }
}

/// Binding to a component that is not present in the document graph.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{runnable} ({field}) references unknown component '{component_id}'")]
pub struct DanglingReference {
    pub runnable: String,
    pub field: String,
    pub component_id: String,
}

/// Failure of a single runnable execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("dispatch failed: {message}")]
    Dispatch { message: String },

    #[error("job {job_id} failed: {message}")]
    Job { job_id: JobId, message: String },

    #[error("execution canceled")]
    Canceled,

    #[error(transparent)]
    Dangling(#[from] DanglingReference),
}

impl ExecutionError {
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch { message: message.into() }
    }

    pub fn job(job_id: JobId, message: impl Into<String>) -> Self {
        Self::Job {
            job_id,
            message: message.into(),
        }
    }

    /// Job the failure belongs to, if the backend got far enough to assign one.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Job { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

/// Structural errors of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("runnable not found: {name}")]
    UnknownRunnable { name: String },

    #[error("duplicate runnable name: {name}")]
    DuplicateRunnable { name: String },

    #[error("cycle detected between runnables: {}", .members.join(", "))]
    Cycle { members: Vec<String> },
}

impl GraphError {
    pub fn unknown_runnable(name: impl Into<String>) -> Self {
        Self::UnknownRunnable { name: name.into() }
    }

    pub fn duplicate_runnable(name: impl Into<String>) -> Self {
        Self::DuplicateRunnable { name: name.into() }
    }
}

/// Errors returned by [`crate::SessionHandle`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result of a superseded run that arrived after a newer run was started.
///
/// Reported for observability only; the result itself is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationRace {
    pub runnable: String,
    pub run_id: u64,
    pub job_id: Option<JobId>,
}

impl fmt::Display for CancellationRace {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.job_id {
            Some(job_id) => write!(formatter, "discarded late result of run {} (job {job_id}) for {}", self.run_id, self.runnable),
            None => write!(formatter, "discarded late result of run {} for {}", self.run_id, self.runnable),
        }
    }
}
