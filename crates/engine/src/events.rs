//! Publish/subscribe channel of session events, optionally filtered per component.

use runboard_types::{ComponentError, JobId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{CancellationRace, DanglingReference, ResolutionWarning};
use crate::executor::{RunId, RunState, Transition, TriggerCause};

const EVENT_CAPACITY: usize = 1024;

/// Observable change of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        runnable: String,
        from: RunState,
        to: RunState,
    },
    Triggered {
        runnable: String,
        cause: TriggerCause,
    },
    JobDispatched {
        runnable: String,
        run_id: RunId,
        job_id: JobId,
    },
    RunFinished {
        runnable: String,
        run_id: RunId,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        outcome: RunState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    OutputChanged {
        component: String,
        key: String,
        value: Value,
    },
    /// A component changed and its dependents were told; `error` carries the component's
    /// failure when the change came from a failed run.
    DependentsNotified {
        component: String,
        dependents: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ComponentError>,
    },
    ResultDiscarded {
        runnable: String,
        run_id: RunId,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
    },
    DanglingReference {
        runnable: String,
        field: String,
        component_id: String,
    },
    ResolutionWarning {
        runnable: String,
        field: String,
        message: String,
    },
    GraphUpdated {
        runnable: String,
        dependencies: Vec<String>,
    },
    ComponentRemoved {
        component: String,
    },
}

impl SessionEvent {
    /// Component or runnable the event is about.
    pub fn subject(&self) -> &str {
        match self {
            SessionEvent::StateChanged { runnable, .. }
            | SessionEvent::Triggered { runnable, .. }
            | SessionEvent::JobDispatched { runnable, .. }
            | SessionEvent::RunFinished { runnable, .. }
            | SessionEvent::ResultDiscarded { runnable, .. }
            | SessionEvent::DanglingReference { runnable, .. }
            | SessionEvent::ResolutionWarning { runnable, .. }
            | SessionEvent::GraphUpdated { runnable, .. } => runnable,
            SessionEvent::OutputChanged { component, .. }
            | SessionEvent::DependentsNotified { component, .. }
            | SessionEvent::ComponentRemoved { component } => component,
        }
    }
}

impl From<Transition> for SessionEvent {
    fn from(transition: Transition) -> Self {
        SessionEvent::StateChanged {
            runnable: transition.runnable,
            from: transition.from,
            to: transition.to,
        }
    }
}

impl From<DanglingReference> for SessionEvent {
    fn from(reference: DanglingReference) -> Self {
        SessionEvent::DanglingReference {
            runnable: reference.runnable,
            field: reference.field,
            component_id: reference.component_id,
        }
    }
}

impl From<ResolutionWarning> for SessionEvent {
    fn from(warning: ResolutionWarning) -> Self {
        SessionEvent::ResolutionWarning {
            runnable: warning.runnable,
            field: warning.field,
            message: warning.message,
        }
    }
}

impl From<CancellationRace> for SessionEvent {
    fn from(race: CancellationRace) -> Self {
        SessionEvent::ResultDiscarded {
            runnable: race.runnable,
            run_id: race.run_id,
            job_id: race.job_id,
        }
    }
}

/// Sending side of the session event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Having no subscriber is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            subject: None,
        }
    }

    /// Subscribes to the events of a single component or runnable.
    pub fn subscribe_to(&self, subject: impl Into<String>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            subject: Some(subject.into()),
        }
    }
}

/// Receiving side of the session event channel.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<SessionEvent>,
    subject: Option<String>,
}

impl Subscription {
    /// Next matching event, or `None` once the session has shut down.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, event: &SessionEvent) -> bool {
        self.subject.as_deref().is_none_or(|subject| event.subject() == subject)
    }
}
