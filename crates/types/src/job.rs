//! Job records surfaced to observers (`jobsById`, `errorByComponent`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Identifier assigned to a job by the execution backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle of a job as seen by the viewer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Running,
    Succeeded,
    Failed,
    /// Cancellation was requested; any late result is discarded.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled)
    }
}

/// Result of the optional frontend transformer applied to a job result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransformerOutcome {
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Entry of the job result store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job: JobId,
    /// Component (runnable) that dispatched the job.
    pub component: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerOutcome>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl JobRecord {
    pub fn new(job: JobId, component: impl Into<String>) -> Self {
        Self {
            job,
            component: component.into(),
            status: JobStatus::Created,
            result: None,
            error: None,
            transformer: None,
            created_at: None,
            started_at: None,
            duration_ms: None,
        }
    }

    /// Merges the fields present in `update`, leaving the others untouched.
    pub fn apply(&mut self, update: JobUpdate) {
        let JobUpdate {
            status,
            result,
            error,
            transformer,
            created_at,
            started_at,
            duration_ms,
        } = update;

        // Start notifications may arrive after the outcome; a terminal status never regresses.
        if let Some(status) = status
            && (status.is_terminal() || !self.status.is_terminal())
        {
            self.status = status;
        }
        if result.is_some() {
            self.result = result;
        }
        if error.is_some() {
            self.error = error;
        }
        if transformer.is_some() {
            self.transformer = transformer;
        }
        if created_at.is_some() {
            self.created_at = created_at;
        }
        if started_at.is_some() {
            self.started_at = started_at;
        }
        if duration_ms.is_some() {
            self.duration_ms = duration_ms;
        }
    }

    /// Duration of the job, only once both the start time and an outcome are known.
    pub fn effective_duration_ms(&self) -> Option<u64> {
        let has_outcome = self.result.is_some() || self.error.is_some();
        match (self.started_at, has_outcome) {
            (Some(_), true) => self.duration_ms,
            _ => None,
        }
    }
}

/// Partial update merged into a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub transformer: Option<TransformerOutcome>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl JobUpdate {
    pub fn created(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Created),
            created_at: Some(at),
            ..Default::default()
        }
    }

    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn succeeded(result: JsonValue, duration_ms: Option<u64>) -> Self {
        Self {
            status: Some(JobStatus::Succeeded),
            result: Some(result),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: Option<u64>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: Some(JobStatus::Canceled),
            ..Default::default()
        }
    }

    pub fn with_started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = started_at;
        self
    }
}

/// Entry of `errorByComponent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentError {
    /// Job that produced the error, when the failure came from the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    pub error: String,
}
