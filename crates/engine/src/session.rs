//! App session: the single writer of the dependency graph, world, run states and job store.
//!
//! A session is an actor. One task owns all mutable state and processes commands in order;
//! handles, timers and execution tasks only ever talk to it through its command queue. Jobs
//! run concurrently on the execution backend and report back through the same queue, which
//! serializes their effects on the world and the job store.

use std::{collections::BTreeSet, ops::ControlFlow, sync::Arc, time::Duration};

use indexmap::IndexMap;
use runboard_types::{AppDocument, ComponentError, JobId, JobRecord, JobStatus, JobUpdate, Runnable};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{CancellationRace, DanglingReference, ExecutionError, GraphError, ResolutionWarning, SessionError};
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::executor::{
    ActiveRun, CompletionVerdict, Coordinator, DispatchRequest, ExecutionBackend, JobCompletion, JobTicket, RunId, RunOutcome, RunState,
    StartedRun, TriggerCause,
};
use crate::graph::{BindingKind, DependencyGraph};
use crate::jobs::JobResultStore;
use crate::world::{ERROR_OUTPUT, LOADING_OUTPUT, RESULT_OUTPUT, World, resolve_inputs};

/// Mutation emitted by the app editor.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    /// A field of an existing runnable was edited; carries the full new definition.
    FieldChanged(Runnable),
    RunnableAdded(Runnable),
    RunnableRemoved(String),
    ComponentAdded(String),
    ComponentRemoved(String),
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub states: IndexMap<String, RunState>,
    pub outputs: World,
    pub error_by_component: IndexMap<String, ComponentError>,
    /// Retained job IDs in dispatch order.
    pub jobs: Vec<JobId>,
    pub jobs_by_id: IndexMap<JobId, JobRecord>,
    /// Runnables currently queued or running.
    pub refreshing: Vec<String>,
    pub loading: bool,
    pub refresh_interval_ms: Option<u64>,
    pub warnings: Vec<ResolutionWarning>,
    pub dangling_references: Vec<DanglingReference>,
}

impl SessionSnapshot {
    pub fn state(&self, runnable: &str) -> Option<RunState> {
        self.states.get(runnable).copied()
    }

    pub fn output(&self, component_id: &str, key: &str) -> Option<&Value> {
        self.outputs.get(component_id, key)
    }

    pub fn error(&self, component_id: &str) -> Option<&ComponentError> {
        self.error_by_component.get(component_id)
    }

    /// Jobs dispatched for a component, oldest first.
    pub fn jobs_for(&self, component_id: &str) -> Vec<&JobRecord> {
        self.jobs_by_id.values().filter(|record| record.component == component_id).collect()
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetOutput {
        component: String,
        key: String,
        value: Value,
        reply: Reply<()>,
    },
    ComponentChanged {
        component: String,
        reply: Reply<Vec<String>>,
    },
    Trigger {
        runnable: String,
        cause: TriggerCause,
        reply: Reply<Result<(), SessionError>>,
    },
    Cancel {
        runnable: String,
        reply: Reply<Result<bool, SessionError>>,
    },
    Editor {
        event: EditorEvent,
        reply: Reply<Result<(), SessionError>>,
    },
    RefreshAll {
        exclude: Option<String>,
        reply: Reply<Vec<String>>,
    },
    SetRefreshInterval {
        interval: Option<Duration>,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    DebounceElapsed {
        runnable: String,
        generation: u64,
    },
    TimerFired {
        runnable: String,
        timer_generation: u64,
    },
    Report {
        runnable: String,
        run_id: RunId,
        report: RunReport,
    },
}

/// Progress of one run, sent by its execution task.
enum RunReport {
    Dispatched(JobTicket),
    DispatchFailed(ExecutionError),
    Finished(JobCompletion),
}

/// Outcome of a run together with the job fields to merge into the store.
struct RunResult {
    job_id: Option<JobId>,
    outcome: Result<Value, ExecutionError>,
    update: JobUpdate,
}

impl RunResult {
    fn without_job(error: ExecutionError) -> Self {
        Self {
            job_id: None,
            outcome: Err(error),
            update: JobUpdate::default(),
        }
    }
}

impl From<JobCompletion> for RunResult {
    fn from(completion: JobCompletion) -> Self {
        Self {
            job_id: Some(completion.job_id),
            outcome: completion.outcome,
            update: JobUpdate {
                transformer: completion.transformer,
                started_at: completion.started_at,
                duration_ms: completion.duration_ms,
                ..JobUpdate::default()
            },
        }
    }
}

/// Cloneable handle used by the rendering layer, the editor and tests to drive a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl SessionHandle {
    /// Writes a component output and refreshes the runnables reading it.
    pub async fn set_component_output(&self, component: impl Into<String>, key: impl Into<String>, value: Value) -> Result<(), SessionError> {
        let (component, key) = (component.into(), key.into());
        self.request(|reply| Command::SetOutput {
            component,
            key,
            value,
            reply,
        })
        .await
    }

    /// Notifies the dependents of a component. Returns the runnables that were triggered.
    pub async fn component_changed(&self, component: impl Into<String>) -> Result<Vec<String>, SessionError> {
        let component = component.into();
        self.request(|reply| Command::ComponentChanged { component, reply }).await
    }

    pub async fn trigger(&self, runnable: impl Into<String>, cause: TriggerCause) -> Result<(), SessionError> {
        let runnable = runnable.into();
        self.request(|reply| Command::Trigger { runnable, cause, reply }).await?
    }

    /// Requests cancellation of the pending and in-flight runs of a runnable.
    ///
    /// Returns immediately with whether anything was active. A job that finishes anyway has
    /// its result discarded.
    pub async fn cancel(&self, runnable: impl Into<String>) -> Result<bool, SessionError> {
        let runnable = runnable.into();
        self.request(|reply| Command::Cancel { runnable, reply }).await?
    }

    pub async fn apply_editor_event(&self, event: EditorEvent) -> Result<(), SessionError> {
        self.request(|reply| Command::Editor { event, reply }).await?
    }

    /// Re-triggers every auto-refresh runnable except `exclude`. Returns the triggered runnables.
    pub async fn refresh_all(&self, exclude: Option<&str>) -> Result<Vec<String>, SessionError> {
        let exclude = exclude.map(str::to_string);
        self.request(|reply| Command::RefreshAll { exclude, reply }).await
    }

    /// Sets or clears the period of the auto-refresh timers.
    pub async fn set_refresh_interval(&self, interval: Option<Duration>) -> Result<(), SessionError> {
        self.request(|reply| Command::SetRefreshInterval { interval, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Cancels in-flight runs and stops the session.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn subscribe_to(&self, subject: impl Into<String>) -> Subscription {
        self.events.subscribe_to(subject)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

/// Session that has been built but not started yet.
///
/// Subscribing before [`AppSession::start`] guarantees that startup events are observed.
pub struct AppSession {
    actor: SessionActor,
    receiver: mpsc::UnboundedReceiver<Command>,
    handle: SessionHandle,
}

impl AppSession {
    pub fn new(
        runnables: impl IntoIterator<Item = Runnable>,
        component_ids: impl IntoIterator<Item = String>,
        backend: Arc<dyn ExecutionBackend>,
        config: SessionConfig,
    ) -> Result<Self, GraphError> {
        let graph = DependencyGraph::build(runnables, component_ids)?;
        let mut coordinator = Coordinator::new();
        for runnable in graph.runnables() {
            coordinator.register(&runnable.name, runnable.allow_concurrent_runs);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let events = EventBus::new();
        let actor = SessionActor {
            graph,
            world: World::new(),
            coordinator,
            jobs: JobResultStore::new(config.job_history_limit),
            errors: IndexMap::new(),
            backend,
            refresh_interval_ms: config.auto_refresh_interval_ms.filter(|ms| *ms > 0),
            config,
            events: events.clone(),
            commands: sender.downgrade(),
        };
        Ok(Self {
            actor,
            receiver,
            handle: SessionHandle { commands: sender, events },
        })
    }

    pub fn from_document(document: &AppDocument, backend: Arc<dyn ExecutionBackend>, config: SessionConfig) -> Result<Self, GraphError> {
        Self::new(document.runnables(), document.component_ids(), backend, config)
    }

    /// Builds and starts a session in one step.
    pub fn spawn(
        runnables: impl IntoIterator<Item = Runnable>,
        component_ids: impl IntoIterator<Item = String>,
        backend: Arc<dyn ExecutionBackend>,
        config: SessionConfig,
    ) -> Result<SessionHandle, GraphError> {
        Ok(Self::new(runnables, component_ids, backend, config)?.start())
    }

    pub fn subscribe(&self) -> Subscription {
        self.handle.subscribe()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Spawns the session task on the current tokio runtime.
    pub fn start(self) -> SessionHandle {
        let Self { actor, receiver, handle } = self;
        tokio::spawn(actor.run(receiver));
        handle
    }
}

struct SessionActor {
    graph: DependencyGraph,
    world: World,
    coordinator: Coordinator,
    jobs: JobResultStore,
    errors: IndexMap<String, ComponentError>,
    backend: Arc<dyn ExecutionBackend>,
    config: SessionConfig,
    /// Period of the auto-refresh timers, in milliseconds.
    refresh_interval_ms: Option<u64>,
    events: EventBus,
    /// Weak so that timers do not keep a session alive once every handle is gone.
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl SessionActor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        self.start();
        self.flush_transitions();
        while let Some(command) = receiver.recv().await {
            let flow = self.handle(command);
            self.flush_transitions();
            if flow.is_break() {
                return;
            }
        }
        self.stop();
        debug!("session closed: every handle was dropped");
    }

    fn start(&mut self) {
        info!(runnables = self.graph.runnables().count(), "session started");
        let warnings: Vec<ResolutionWarning> = self.graph.warnings().into_iter().cloned().collect();
        for warning in warnings {
            self.events.publish(warning.into());
        }
        for reference in self.graph.dangling_references() {
            self.report_dangling(reference);
        }
        if let Err(error) = self.graph.refresh_order() {
            warn!(error = %error, "refresh cascades may not settle");
        }
        if self.config.refresh_on_start {
            for name in self.auto_refresh_runnables(None) {
                if let Err(error) = self.trigger(&name, TriggerCause::Startup) {
                    warn!(runnable = %name, error = %error, "startup refresh failed");
                }
            }
        }
    }

    fn stop(&mut self) {
        let names: Vec<String> = self.coordinator.states().map(|(name, _)| name.clone()).collect();
        for name in names {
            let canceled = self.coordinator.cancel(&name);
            self.discard_runs(&name, canceled);
        }
        self.flush_transitions();
        info!("session stopped");
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SetOutput {
                component,
                key,
                value,
                reply,
            } => {
                self.set_component_output(&component, &key, value);
                let _ = reply.send(());
            }
            Command::ComponentChanged { component, reply } => {
                let error = self.errors.get(&component).cloned();
                let _ = reply.send(self.notify_dependents(&component, error, BTreeSet::new()));
            }
            Command::Trigger { runnable, cause, reply } => {
                let _ = reply.send(self.trigger(&runnable, cause));
            }
            Command::Cancel { runnable, reply } => {
                let _ = reply.send(self.cancel(&runnable));
            }
            Command::Editor { event, reply } => {
                let _ = reply.send(self.apply_editor_event(event));
            }
            Command::RefreshAll { exclude, reply } => {
                let _ = reply.send(self.refresh_all(exclude.as_deref()));
            }
            Command::SetRefreshInterval { interval, reply } => {
                self.set_refresh_interval(interval);
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.stop();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            Command::DebounceElapsed { runnable, generation } => self.start_run(&runnable, generation),
            Command::TimerFired {
                runnable,
                timer_generation,
            } => {
                if !self.coordinator.timer_is_current(&runnable, timer_generation) {
                    return ControlFlow::Continue(());
                }
                // A tick never supersedes the run it would refresh; wait for the next one.
                if self.coordinator.state(&runnable).is_some_and(RunState::is_active) {
                    debug!(runnable = %runnable, "auto-refresh timer fired during a run, re-arming");
                    self.arm_timer(&runnable);
                } else {
                    debug!(runnable = %runnable, "auto-refresh timer fired");
                    let _ = self.trigger(&runnable, TriggerCause::AutoRefresh);
                }
            }
            Command::Report { runnable, run_id, report } => self.on_report(&runnable, run_id, report),
        }
        ControlFlow::Continue(())
    }

    fn set_component_output(&mut self, component: &str, key: &str, value: Value) {
        if !self.graph.contains_component(component) {
            warn!(component, key, "ignoring output of unknown component");
            return;
        }
        if self.write_output(component, key, value) {
            let error = self.errors.get(component).cloned();
            self.notify_dependents(component, error, BTreeSet::new());
        }
    }

    fn trigger(&mut self, runnable: &str, cause: TriggerCause) -> Result<(), SessionError> {
        self.trigger_in_cascade(runnable, cause, BTreeSet::new())
    }

    fn trigger_in_cascade(&mut self, runnable: &str, cause: TriggerCause, lineage: BTreeSet<String>) -> Result<(), SessionError> {
        let decision = self
            .coordinator
            .trigger_in_cascade(runnable, cause.clone(), lineage)
            .ok_or_else(|| GraphError::unknown_runnable(runnable))?;
        debug!(
            runnable,
            cause = ?cause,
            generation = decision.generation,
            coalesced = decision.coalesced,
            "runnable triggered"
        );
        self.events.publish(SessionEvent::Triggered {
            runnable: runnable.to_string(),
            cause,
        });
        self.discard_runs(runnable, decision.superseded);

        let debounce = self.config.debounce();
        if debounce.is_zero() {
            self.start_run(runnable, decision.generation);
        } else {
            self.schedule(
                debounce,
                Command::DebounceElapsed {
                    runnable: runnable.to_string(),
                    generation: decision.generation,
                },
            );
        }
        Ok(())
    }

    fn cancel(&mut self, runnable: &str) -> Result<bool, SessionError> {
        if !self.coordinator.contains(runnable) {
            return Err(GraphError::unknown_runnable(runnable).into());
        }
        let was_active = self.coordinator.state(runnable).is_some_and(RunState::is_active);
        let canceled = self.coordinator.cancel(runnable);
        if was_active {
            info!(runnable, runs = canceled.len(), "run canceled");
        }
        self.discard_runs(runnable, canceled);
        Ok(was_active)
    }

    /// Marks the jobs of canceled or superseded runs and asks the backend to stop them.
    fn discard_runs(&mut self, runnable: &str, runs: Vec<ActiveRun>) {
        for run in runs {
            let Some(job_id) = run.job_id else {
                continue;
            };
            self.jobs.update_existing(&job_id, JobUpdate::canceled());
            self.cancel_backend_job(job_id);
        }
    }

    fn cancel_backend_job(&self, job_id: JobId) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            backend.cancel_job(&job_id).await;
        });
    }

    fn start_run(&mut self, name: &str, generation: u64) {
        let Some(run) = self.coordinator.start_pending(name, generation) else {
            return;
        };
        let Some(runnable) = self.graph.runnable(name).cloned() else {
            self.finish_run(name, run.run_id, RunResult::without_job(ExecutionError::dispatch("runnable no longer exists")));
            return;
        };
        if runnable.auto_refresh {
            self.arm_timer(name);
        }

        let inputs = match resolve_inputs(&runnable, &self.world, &self.graph) {
            Ok(inputs) => inputs,
            Err(reference) => {
                self.report_dangling(reference.clone());
                self.finish_run(name, run.run_id, RunResult::without_job(reference.into()));
                return;
            }
        };

        info!(runnable = name, run_id = run.run_id, cause = ?run.cause, "run started");
        let request = DispatchRequest {
            runnable: name.to_string(),
            source: runnable.source,
            inputs,
            transformer: runnable.transformer,
        };
        self.spawn_execution(run, request);
    }

    fn spawn_execution(&self, run: StartedRun, request: DispatchRequest) {
        let Some(reports) = self.commands.upgrade() else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let StartedRun { runnable, run_id, token, .. } = run;
            if token.is_cancelled() {
                return;
            }
            let report = |report| Command::Report {
                runnable: runnable.clone(),
                run_id,
                report,
            };

            let ticket = match backend.dispatch(request).await {
                Ok(ticket) => ticket,
                Err(error) => {
                    let _ = reports.send(report(RunReport::DispatchFailed(error)));
                    return;
                }
            };
            let job_id = ticket.job_id.clone();
            let _ = reports.send(report(RunReport::Dispatched(ticket)));
            // No select on the token here: a backend that ignores cancellation still reports,
            // and the session discards the late result.
            let completion = backend.wait_for_completion(&job_id, token).await;
            let _ = reports.send(report(RunReport::Finished(completion)));
        });
    }

    fn on_report(&mut self, runnable: &str, run_id: RunId, report: RunReport) {
        match report {
            RunReport::Dispatched(ticket) => {
                if self.coordinator.attach_job(runnable, run_id, ticket.job_id.clone()) {
                    debug!(runnable, run_id, job_id = %ticket.job_id, "job dispatched");
                    self.jobs.record(&ticket.job_id, runnable, JobUpdate::created(ticket.created_at));
                    self.events.publish(SessionEvent::JobDispatched {
                        runnable: runnable.to_string(),
                        run_id,
                        job_id: ticket.job_id,
                    });
                } else {
                    // Superseded while the backend was still accepting the job. It never became
                    // current, so it takes no slot in the job history.
                    debug!(runnable, run_id, job_id = %ticket.job_id, "dispatch of a superseded run");
                    self.cancel_backend_job(ticket.job_id);
                }
            }
            RunReport::DispatchFailed(error) => self.finish_run(runnable, run_id, RunResult::without_job(error)),
            RunReport::Finished(completion) => self.finish_run(runnable, run_id, completion.into()),
        }
    }

    fn finish_run(&mut self, name: &str, run_id: RunId, result: RunResult) {
        let RunResult {
            job_id,
            outcome,
            mut update,
        } = result;
        let run_outcome = match &outcome {
            Ok(_) => RunOutcome::Succeeded,
            Err(ExecutionError::Canceled) => RunOutcome::Canceled,
            Err(_) => RunOutcome::Failed,
        };

        let mut lineage = self.coordinator.lineage_of(name, run_id);
        if self.coordinator.complete(name, run_id, run_outcome) == CompletionVerdict::Discard {
            let race = CancellationRace {
                runnable: name.to_string(),
                run_id,
                job_id: job_id.clone(),
            };
            debug!(race = %race, "cancellation race");
            if let Some(job_id) = &job_id {
                self.jobs.update_existing(job_id, JobUpdate::canceled());
            }
            self.events.publish(race.into());
            return;
        }

        update.status = Some(match run_outcome {
            RunOutcome::Succeeded => JobStatus::Succeeded,
            RunOutcome::Failed => JobStatus::Failed,
            RunOutcome::Canceled => JobStatus::Canceled,
        });
        match &outcome {
            Ok(value) => update.result = Some(value.clone()),
            Err(error) => update.error = Some(error.to_string()),
        }
        if let Some(job_id) = &job_id {
            self.jobs.record(job_id, name, update);
        }

        let error_message = outcome.as_ref().err().map(ToString::to_string);
        info!(runnable = name, run_id, job_id = ?job_id, outcome = ?run_outcome, "run finished");
        self.events.publish(SessionEvent::RunFinished {
            runnable: name.to_string(),
            run_id,
            job_id: job_id.clone(),
            outcome: run_outcome.into(),
            error: error_message,
        });

        match outcome {
            Ok(value) => {
                self.errors.shift_remove(name);
                self.world.remove(name, ERROR_OUTPUT);
                self.write_output(name, RESULT_OUTPUT, value);
                lineage.insert(name.to_string());
                self.notify_dependents(name, None, lineage);
            }
            Err(ExecutionError::Canceled) => {}
            Err(error) => {
                warn!(runnable = name, job_id = ?job_id, error = %error, "run failed");
                let component_error = ComponentError {
                    id: job_id,
                    error: error.to_string(),
                };
                self.errors.insert(name.to_string(), component_error.clone());
                self.write_output(name, ERROR_OUTPUT, Value::String(component_error.error.clone()));
                lineage.insert(name.to_string());
                self.notify_dependents(name, Some(component_error), lineage);
            }
        }
    }

    /// Tells the dependents of `component` that it changed and triggers those that refresh.
    ///
    /// `lineage` holds the runnables already run in the current cascade. They are not triggered
    /// again, which stops refreshes from circling around a dependency cycle. Returns the
    /// triggered runnables.
    fn notify_dependents(&mut self, component: &str, error: Option<ComponentError>, mut lineage: BTreeSet<String>) -> Vec<String> {
        let dependents: Vec<String> = self.graph.on_component_changed(component).into_iter().collect();
        if dependents.is_empty() {
            return Vec::new();
        }
        debug!(component, dependents = dependents.len(), has_error = error.is_some(), "notifying dependents");
        self.events.publish(SessionEvent::DependentsNotified {
            component: component.to_string(),
            dependents: dependents.clone(),
            error,
        });

        let forced: Vec<String> = self
            .graph
            .bindings(component)
            .map(|bindings| bindings.recompute_targets.clone())
            .unwrap_or_default();
        lineage.insert(component.to_string());
        let mut triggered = Vec::new();
        for dependent in dependents {
            if lineage.contains(&dependent) {
                warn!(runnable = %dependent, component, "refresh cascade returned to a runnable it already ran; stopping");
                continue;
            }
            let cause = if forced.contains(&dependent) {
                TriggerCause::Recompute {
                    source: component.to_string(),
                }
            } else if self.refreshes_on(&dependent, component) {
                TriggerCause::Dependency {
                    component: component.to_string(),
                }
            } else {
                debug!(runnable = %dependent, component, "input changed but recompute is disabled");
                continue;
            };
            if self.trigger_in_cascade(&dependent, cause, lineage.clone()).is_ok() {
                triggered.push(dependent);
            }
        }
        triggered
    }

    /// Explicit `refreshOn` triggers fire even when input-driven recompute is off.
    fn refreshes_on(&self, runnable: &str, component: &str) -> bool {
        let Some(definition) = self.graph.runnable(runnable) else {
            return false;
        };
        if definition.recomputes_on_input_change() {
            return true;
        }
        self.graph
            .bindings(runnable)
            .and_then(|bindings| bindings.dependencies.get(component))
            .is_some_and(|sites| sites.iter().any(|site| matches!(site.kind, BindingKind::RefreshTrigger { .. })))
    }

    fn apply_editor_event(&mut self, event: EditorEvent) -> Result<(), SessionError> {
        match event {
            EditorEvent::FieldChanged(runnable) => {
                let name = runnable.name.clone();
                let allow_concurrent = runnable.allow_concurrent_runs;
                self.graph.edit_runnable(&name, |current| *current = runnable)?;
                self.coordinator.register(&name, allow_concurrent);
                self.publish_graph_update(&name);
            }
            EditorEvent::RunnableAdded(runnable) => {
                if self.graph.runnable(&runnable.name).is_some() {
                    return Err(GraphError::duplicate_runnable(runnable.name).into());
                }
                let name = runnable.name.clone();
                let auto_refresh = runnable.auto_refresh;
                self.coordinator.register(&name, runnable.allow_concurrent_runs);
                self.graph.upsert_runnable(runnable);
                self.publish_graph_update(&name);
                if auto_refresh {
                    self.trigger(&name, TriggerCause::Startup)?;
                }
            }
            EditorEvent::RunnableRemoved(name) => {
                if self.graph.runnable(&name).is_none() {
                    return Err(GraphError::unknown_runnable(name).into());
                }
                self.remove_component(&name);
            }
            EditorEvent::ComponentAdded(component) => {
                debug!(component = %component, "component added");
                self.graph.add_component(component);
            }
            EditorEvent::ComponentRemoved(component) => self.remove_component(&component),
        }
        Ok(())
    }

    fn publish_graph_update(&mut self, name: &str) {
        let Some(bindings) = self.graph.bindings(name) else {
            return;
        };
        let dependencies = bindings.component_ids().into_iter().map(str::to_string).collect();
        let warnings = bindings.warnings.clone();
        debug!(runnable = name, "dependency edges rebuilt");
        self.events.publish(SessionEvent::GraphUpdated {
            runnable: name.to_string(),
            dependencies,
        });
        for warning in warnings {
            self.events.publish(warning.into());
        }
        for reference in self.graph.dangling_references_for(name) {
            self.report_dangling(reference);
        }
    }

    fn remove_component(&mut self, component: &str) {
        let canceled = self.coordinator.remove(component);
        self.discard_runs(component, canceled);
        let removed_runnable = self.graph.remove_component(component);
        self.world.remove_component(component);
        let cleared_jobs = self.jobs.clear(component);
        self.errors.shift_remove(component);
        info!(
            component,
            runnable = removed_runnable.is_some(),
            cleared_jobs,
            "component removed"
        );
        self.events.publish(SessionEvent::ComponentRemoved {
            component: component.to_string(),
        });

        let orphaned: Vec<DanglingReference> = self
            .graph
            .dangling_references()
            .into_iter()
            .filter(|reference| reference.component_id == component)
            .collect();
        for reference in orphaned {
            self.report_dangling(reference);
        }
    }

    fn refresh_all(&mut self, exclude: Option<&str>) -> Vec<String> {
        let names = self.auto_refresh_runnables(exclude);
        info!(count = names.len(), exclude = ?exclude, "refreshing all auto-refresh runnables");
        names
            .into_iter()
            .filter(|name| self.trigger(name, TriggerCause::RefreshAll).is_ok())
            .collect()
    }

    fn set_refresh_interval(&mut self, interval: Option<Duration>) {
        self.refresh_interval_ms = interval
            .map(|interval| u64::try_from(interval.as_millis()).unwrap_or(u64::MAX))
            .filter(|ms| *ms > 0);
        info!(interval_ms = ?self.refresh_interval_ms, "refresh interval updated");
        for name in self.auto_refresh_runnables(None) {
            self.arm_timer(&name);
        }
    }

    /// Re-arms the auto-refresh timer of a runnable; older timers become no-ops.
    fn arm_timer(&mut self, runnable: &str) {
        let Some(timer_generation) = self.coordinator.reset_timer(runnable) else {
            return;
        };
        if let Some(interval_ms) = self.refresh_interval_ms {
            self.schedule(
                Duration::from_millis(interval_ms),
                Command::TimerFired {
                    runnable: runnable.to_string(),
                    timer_generation,
                },
            );
        }
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command);
            }
        });
    }

    fn auto_refresh_runnables(&self, exclude: Option<&str>) -> Vec<String> {
        self.graph
            .runnables()
            .filter(|runnable| runnable.auto_refresh && Some(runnable.name.as_str()) != exclude)
            .map(|runnable| runnable.name.clone())
            .collect()
    }

    /// Writes an output and publishes it when the value changed.
    fn write_output(&mut self, component: &str, key: &str, value: Value) -> bool {
        if !self.world.set(component, key, value.clone()) {
            return false;
        }
        self.events.publish(SessionEvent::OutputChanged {
            component: component.to_string(),
            key: key.to_string(),
            value,
        });
        true
    }

    fn report_dangling(&self, reference: DanglingReference) {
        warn!(
            runnable = %reference.runnable,
            field = %reference.field,
            component_id = %reference.component_id,
            "dangling reference"
        );
        self.events.publish(reference.into());
    }

    fn flush_transitions(&mut self) {
        for transition in self.coordinator.drain_transitions() {
            match transition.to {
                RunState::Queued => {
                    self.world.set(&transition.runnable, LOADING_OUTPUT, Value::Bool(true));
                }
                RunState::Idle => {
                    self.world.set(&transition.runnable, LOADING_OUTPUT, Value::Bool(false));
                }
                _ => {}
            }
            self.events.publish(transition.into());
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let refreshing = self.coordinator.refreshing();
        SessionSnapshot {
            states: self.coordinator.states().map(|(name, state)| (name.clone(), state)).collect(),
            outputs: self.world.clone(),
            error_by_component: self.errors.clone(),
            jobs: self.jobs.job_ids(),
            jobs_by_id: self.jobs.records().map(|record| (record.job.clone(), record.clone())).collect(),
            loading: !refreshing.is_empty(),
            refreshing,
            refresh_interval_ms: self.refresh_interval_ms,
            warnings: self.graph.warnings().into_iter().cloned().collect(),
            dangling_references: self.graph.dangling_references(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::NoopBackend;
    use runboard_types::FieldConfiguration;
    use serde_json::json;

    fn config(debounce_ms: u64) -> SessionConfig {
        SessionConfig {
            debounce_ms,
            refresh_on_start: false,
            ..SessionConfig::default()
        }
    }

    fn reader(name: &str, component: &str) -> Runnable {
        Runnable::new(name).with_field("value", FieldConfiguration::connected(component, "value"))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn output_change_runs_dependent_with_resolved_inputs() {
        let handle = AppSession::spawn([reader("r", "a")], ["a".to_string()], Arc::new(NoopBackend::new()), config(10)).expect("session");

        handle.set_component_output("a", "value", json!(42)).await.expect("set output");
        settle().await;

        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.state("r"), Some(RunState::Idle));
        assert_eq!(
            snapshot.output("r", RESULT_OUTPUT),
            Some(&json!({"runnable": "r", "inputs": {"value": 42}}))
        );
        assert_eq!(snapshot.output("r", LOADING_OUTPUT), Some(&json!(false)));
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs_for("r")[0].status, JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_triggers_auto_refresh_runnables() {
        let auto = Runnable {
            auto_refresh: true,
            ..Runnable::new("auto")
        };
        let manual = Runnable::new("manual");
        let session = AppSession::new(
            [auto, manual],
            Vec::new(),
            Arc::new(NoopBackend::new()),
            SessionConfig {
                debounce_ms: 0,
                ..SessionConfig::default()
            },
        )
        .expect("session");
        let mut events = session.subscribe();
        let handle = session.start();
        settle().await;

        let mut triggered = Vec::new();
        while let Some(event) = events.try_recv() {
            if let SessionEvent::Triggered { runnable, cause } = event {
                triggered.push((runnable, cause));
            }
        }
        assert_eq!(triggered, vec![("auto".to_string(), TriggerCause::Startup)]);
        let snapshot = handle.snapshot().await.expect("snapshot");
        assert!(snapshot.output("manual", RESULT_OUTPUT).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_recompute_skips_dependency_triggers() {
        let passive = Runnable {
            recompute_on_input_changed: Some(false),
            ..reader("passive", "a")
        };
        let handle = AppSession::spawn([passive], ["a".to_string()], Arc::new(NoopBackend::new()), config(0)).expect("session");

        let triggered = handle.component_changed("a").await.expect("changed");
        assert!(triggered.is_empty());
        settle().await;
        assert!(handle.snapshot().await.expect("snapshot").jobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_runnable_is_reported() {
        let handle = AppSession::spawn(Vec::<Runnable>::new(), Vec::new(), Arc::new(NoopBackend::new()), config(0)).expect("session");

        let error = handle.trigger("ghost", TriggerCause::Manual).await.expect_err("unknown");
        assert!(matches!(error, SessionError::Graph(GraphError::UnknownRunnable { .. })));
        assert!(matches!(handle.cancel("ghost").await, Err(SessionError::Graph(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn recompute_ids_force_targets_after_completion() {
        let source = Runnable {
            recompute_ids: vec!["target".into()],
            ..Runnable::new("source")
        };
        let target = Runnable {
            recompute_on_input_changed: Some(false),
            ..Runnable::new("target")
        };
        let session = AppSession::new([source, target], Vec::new(), Arc::new(NoopBackend::new()), config(0)).expect("session");
        let mut events = session.handle().subscribe_to("target");
        let handle = session.start();

        handle.trigger("source", TriggerCause::Manual).await.expect("trigger");
        settle().await;

        let mut causes = Vec::new();
        while let Some(event) = events.try_recv() {
            if let SessionEvent::Triggered { cause, .. } = event {
                causes.push(cause);
            }
        }
        assert_eq!(
            causes,
            vec![TriggerCause::Recompute {
                source: "source".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_timer_reruns_until_cleared() {
        let auto = Runnable {
            auto_refresh: true,
            ..Runnable::new("auto")
        };
        let handle = AppSession::spawn([auto], Vec::new(), Arc::new(NoopBackend::new()), config(0)).expect("session");

        handle.set_refresh_interval(Some(Duration::from_secs(1))).await.expect("interval");
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let runs = handle.snapshot().await.expect("snapshot").jobs.len();
        assert_eq!(runs, 3);

        handle.set_refresh_interval(None).await.expect("interval");
        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.jobs.len(), 3);
        assert_eq!(snapshot.refresh_interval_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_tick_during_a_slow_run_lets_it_finish() {
        let auto = Runnable {
            auto_refresh: true,
            ..Runnable::new("auto")
        };
        let backend = Arc::new(NoopBackend::with_delay(Duration::from_millis(1500)));
        let handle = AppSession::spawn([auto], Vec::new(), backend, config(0)).expect("session");

        // Timer ticks at 1s; runs take 1.5s and re-arm the timer when they start.
        handle.set_refresh_interval(Some(Duration::from_secs(1))).await.expect("interval");
        tokio::time::sleep(Duration::from_millis(4800)).await;

        let snapshot = handle.snapshot().await.expect("snapshot");
        let statuses: Vec<JobStatus> = snapshot.jobs_for("auto").iter().map(|record| record.status).collect();
        assert_eq!(statuses, vec![JobStatus::Succeeded, JobStatus::Succeeded]);
        assert!(snapshot.output("auto", RESULT_OUTPUT).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_configured_interval_in_milliseconds() {
        let config = SessionConfig {
            auto_refresh_interval_ms: Some(1_500),
            ..config(0)
        };
        let handle = AppSession::spawn(Vec::<Runnable>::new(), Vec::new(), Arc::new(NoopBackend::new()), config).expect("session");
        assert_eq!(handle.snapshot().await.expect("snapshot").refresh_interval_ms, Some(1_500));

        handle.set_refresh_interval(Some(Duration::from_micros(2_500_900))).await.expect("interval");
        assert_eq!(handle.snapshot().await.expect("snapshot").refresh_interval_ms, Some(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_all_skips_excluded_runnable() {
        let runnables = ["a", "b", "c"].map(|name| Runnable {
            auto_refresh: name != "c",
            ..Runnable::new(name)
        });
        let handle = AppSession::spawn(runnables, Vec::new(), Arc::new(NoopBackend::new()), config(0)).expect("session");

        let triggered = handle.refresh_all(Some("a")).await.expect("refresh all");
        assert_eq!(triggered, vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_session() {
        let handle = AppSession::spawn(Vec::<Runnable>::new(), Vec::new(), Arc::new(NoopBackend::new()), config(0)).expect("session");
        handle.shutdown().await.expect("shutdown");
        assert!(matches!(handle.snapshot().await, Err(SessionError::Closed)));
    }
}
