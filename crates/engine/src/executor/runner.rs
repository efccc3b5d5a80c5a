use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use runboard_types::{InlineScript, JobId, RunnableSource, TransformerOutcome};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExecutionError;

/// Work handed to the execution backend for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub runnable: String,
    pub source: Option<RunnableSource>,
    /// Inputs resolved against the world at dispatch time.
    pub inputs: Map<String, Value>,
    pub transformer: Option<InlineScript>,
}

/// Acknowledgement of a dispatched job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTicket {
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

impl JobTicket {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a job as delivered by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub outcome: Result<Value, ExecutionError>,
    pub transformer: Option<TransformerOutcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl JobCompletion {
    pub fn success(job_id: JobId, result: Value) -> Self {
        Self {
            job_id,
            outcome: Ok(result),
            transformer: None,
            started_at: None,
            duration_ms: None,
        }
    }

    pub fn failure(job_id: JobId, error: ExecutionError) -> Self {
        Self {
            job_id,
            outcome: Err(error),
            transformer: None,
            started_at: None,
            duration_ms: None,
        }
    }

    pub fn canceled(job_id: JobId) -> Self {
        Self::failure(job_id, ExecutionError::Canceled)
    }

    pub fn with_timing(mut self, started_at: DateTime<Utc>, duration_ms: u64) -> Self {
        self.started_at = Some(started_at);
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Executes runnables on behalf of a session.
///
/// Engines can provide concrete implementations that call a job queue, a script host, or
/// anything else. The session treats the backend as an opaque dispatch/notify interface.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit a run and return the job identifier assigned to it.
    async fn dispatch(&self, request: DispatchRequest) -> Result<JobTicket, ExecutionError>;

    /// Wait for the job to finish.
    ///
    /// Implementations should observe `cancellation` at their yield points and report
    /// [`ExecutionError::Canceled`]. A result delivered after cancellation is discarded.
    async fn wait_for_completion(&self, job_id: &JobId, cancellation: CancellationToken) -> JobCompletion;

    /// Best-effort request to stop a job on the backend side.
    async fn cancel_job(&self, _job_id: &JobId) {}
}

/// Backend that echoes the resolved inputs as the job result. This allows tests and
/// previews without external side effects.
#[derive(Debug, Default)]
pub struct NoopBackend {
    delay: Option<Duration>,
    next_job: AtomicU64,
    pending: Mutex<HashMap<JobId, DispatchRequest>>,
}

impl NoopBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a job that takes `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for NoopBackend {
    async fn dispatch(&self, request: DispatchRequest) -> Result<JobTicket, ExecutionError> {
        let sequence = self.next_job.fetch_add(1, Ordering::Relaxed) + 1;
        let job_id = JobId::new(format!("noop-{sequence}"));
        debug!(runnable = %request.runnable, job_id = %job_id, "noop backend accepted job");
        self.pending.lock().await.insert(job_id.clone(), request);
        Ok(JobTicket::new(job_id))
    }

    async fn wait_for_completion(&self, job_id: &JobId, cancellation: CancellationToken) -> JobCompletion {
        let started_at = Utc::now();
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => {
                    self.pending.lock().await.remove(job_id);
                    return JobCompletion::canceled(job_id.clone());
                }
            }
        }

        let Some(request) = self.pending.lock().await.remove(job_id) else {
            return JobCompletion::failure(job_id.clone(), ExecutionError::job(job_id.clone(), "unknown job"));
        };
        let mut result = Map::new();
        result.insert("runnable".into(), Value::String(request.runnable));
        result.insert("inputs".into(), Value::Object(request.inputs));
        let duration_ms = self.delay.map(|delay| delay.as_millis() as u64).unwrap_or_default();
        JobCompletion::success(job_id.clone(), Value::Object(result)).with_timing(started_at, duration_ms)
    }

    async fn cancel_job(&self, job_id: &JobId) {
        self.pending.lock().await.remove(job_id);
    }
}
