use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use indexmap::indexmap;
use runboard_engine::{
    AppSession, DependencyGraph, DispatchRequest, EditorEvent, ExecutionBackend, ExecutionError, JobCompletion, JobTicket, RunState,
    SessionConfig, SessionEvent, Subscription, TriggerCause,
};
use runboard_types::{FieldConfiguration, JobId, JobStatus, OneOfConfiguration, Runnable};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

/// How the backend answers one dispatch of a runnable.
#[derive(Clone)]
struct Plan {
    delay: Duration,
    outcome: Result<Value, String>,
    /// Keep running after cancellation and deliver the result anyway.
    stubborn: bool,
}

impl Plan {
    fn ok(delay_ms: u64, value: Value) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            outcome: Ok(value),
            stubborn: false,
        }
    }

    fn fail(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(message.to_string()),
            stubborn: false,
        }
    }

    fn stubborn(mut self) -> Self {
        self.stubborn = true;
        self
    }
}

#[derive(Default)]
struct ScriptedBackend {
    plans: Mutex<HashMap<String, VecDeque<Plan>>>,
    jobs: Mutex<HashMap<JobId, Plan>>,
    dispatched: Mutex<Vec<(String, Map<String, Value>)>>,
    canceled: Mutex<Vec<JobId>>,
    next_job: AtomicU64,
}

impl ScriptedBackend {
    fn plan(self, runnable: &str, plans: impl IntoIterator<Item = Plan>) -> Self {
        self.plans.lock().unwrap().entry(runnable.to_string()).or_default().extend(plans);
        self
    }

    fn dispatched_for(&self, runnable: &str) -> Vec<Map<String, Value>> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == runnable)
            .map(|(_, inputs)| inputs.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn dispatch(&self, request: DispatchRequest) -> Result<JobTicket, ExecutionError> {
        let job_id = JobId::new(format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst) + 1));
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&request.runnable)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Plan::ok(0, json!({ "from": request.runnable })));
        self.jobs.lock().unwrap().insert(job_id.clone(), plan);
        self.dispatched.lock().unwrap().push((request.runnable, request.inputs));
        Ok(JobTicket::new(job_id))
    }

    async fn wait_for_completion(&self, job_id: &JobId, cancellation: CancellationToken) -> JobCompletion {
        let plan = self.jobs.lock().unwrap().get(job_id).cloned().expect("planned job");
        if plan.stubborn {
            tokio::time::sleep(plan.delay).await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(plan.delay) => {}
                _ = cancellation.cancelled() => return JobCompletion::canceled(job_id.clone()),
            }
        }
        match plan.outcome {
            Ok(value) => JobCompletion::success(job_id.clone(), value),
            Err(message) => JobCompletion::failure(job_id.clone(), ExecutionError::job(job_id.clone(), message)),
        }
    }

    async fn cancel_job(&self, job_id: &JobId) {
        self.canceled.lock().unwrap().push(job_id.clone());
    }
}

fn config(debounce_ms: u64) -> SessionConfig {
    SessionConfig {
        debounce_ms,
        refresh_on_start: false,
        ..SessionConfig::default()
    }
}

fn reader(name: &str, component: &str, path: &str) -> Runnable {
    Runnable::new(name).with_field("value", FieldConfiguration::connected(component, path))
}

fn components(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn drain(events: &mut Subscription) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Some(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[test]
fn component_change_returns_exactly_the_connected_runnables() {
    let runnables = vec![
        reader("r1", "a", "value"),
        reader("r2", "b", "value"),
        reader("r3", "a", "value").with_field("other", FieldConfiguration::connected("b", "value")),
        Runnable::new("r4").with_field("limit", FieldConfiguration::static_value(json!(5))),
    ];
    let graph = DependencyGraph::build(runnables, components(&["a", "b"])).expect("graph");

    assert_eq!(graph.on_component_changed("a").into_iter().collect::<Vec<_>>(), vec!["r1", "r3"]);
    assert_eq!(graph.on_component_changed("b").into_iter().collect::<Vec<_>>(), vec!["r2", "r3"]);
    assert!(graph.on_component_changed("r4").is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_changes_within_debounce_window_run_dependent_once() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = AppSession::spawn([reader("r", "a", "value")], components(&["a"]), backend.clone(), config(50)).expect("session");

    handle.set_component_output("a", "value", json!(1)).await.expect("first change");
    advance(10).await;
    handle.set_component_output("a", "value", json!(2)).await.expect("second change");
    advance(500).await;

    let dispatched = backend.dispatched_for("r");
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0]["value"], json!(2));
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state("r"), Some(RunState::Idle));
    assert_eq!(snapshot.output("r", "result"), Some(&json!({"from": "r"})));
}

#[tokio::test(start_paused = true)]
async fn trigger_while_running_supersedes_and_discards_late_result() {
    let backend = Arc::new(ScriptedBackend::default().plan(
        "r",
        [Plan::ok(100, json!("old")).stubborn(), Plan::ok(10, json!("new"))],
    ));
    let session = AppSession::new([Runnable::new("r")], Vec::new(), backend.clone(), config(0)).expect("session");
    let mut events = session.subscribe();
    let handle = session.start();

    handle.trigger("r", TriggerCause::Manual).await.expect("first trigger");
    advance(20).await;
    handle.trigger("r", TriggerCause::Manual).await.expect("second trigger");
    advance(300).await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.output("r", "result"), Some(&json!("new")));
    let statuses: Vec<JobStatus> = snapshot.jobs_for("r").iter().map(|record| record.status).collect();
    assert_eq!(statuses, vec![JobStatus::Canceled, JobStatus::Succeeded]);
    assert_eq!(*backend.canceled.lock().unwrap(), vec![JobId::new("job-1")]);

    let events = drain(&mut events);
    let running = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::StateChanged { to: RunState::Running, .. }))
        .count();
    assert_eq!(running, 2);
    let finished: Vec<&SessionEvent> = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::RunFinished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::ResultDiscarded { run_id: 1, job_id: Some(job_id), .. } if job_id.as_str() == "job-1"
    )));
}

#[tokio::test(start_paused = true)]
async fn late_result_of_evicted_job_keeps_the_newer_job() {
    let backend = Arc::new(ScriptedBackend::default().plan(
        "r",
        [Plan::ok(100, json!("old")).stubborn(), Plan::ok(10, json!("new"))],
    ));
    let config = SessionConfig {
        job_history_limit: 1,
        ..config(0)
    };
    let handle = AppSession::spawn([Runnable::new("r")], Vec::new(), backend, config).expect("session");

    handle.trigger("r", TriggerCause::Manual).await.expect("first trigger");
    advance(20).await;
    handle.trigger("r", TriggerCause::Manual).await.expect("second trigger");
    advance(30).await;
    assert_eq!(handle.snapshot().await.expect("snapshot").jobs, vec![JobId::new("job-2")]);

    advance(300).await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.jobs, vec![JobId::new("job-2")]);
    let statuses: Vec<(&str, JobStatus)> = snapshot
        .jobs_for("r")
        .iter()
        .map(|record| (record.job.as_str(), record.status))
        .collect();
    assert_eq!(statuses, vec![("job-2", JobStatus::Succeeded)]);
    assert_eq!(snapshot.output("r", "result"), Some(&json!("new")));
}

#[tokio::test(start_paused = true)]
async fn refresh_cascade_stops_at_a_dependency_cycle() {
    let backend = Arc::new(ScriptedBackend::default());
    let x = reader("x", "y", "result");
    let y = reader("y", "x", "result");
    let handle = AppSession::spawn([x, y], Vec::new(), backend.clone(), config(0)).expect("session");

    handle.trigger("x", TriggerCause::Manual).await.expect("trigger");
    advance(1000).await;
    assert_eq!(backend.dispatched_for("x").len(), 1);
    assert_eq!(backend.dispatched_for("y").len(), 1);

    handle.trigger("y", TriggerCause::Manual).await.expect("trigger");
    advance(1000).await;
    assert_eq!(backend.dispatched_for("x").len(), 2);
    assert_eq!(backend.dispatched_for("y").len(), 2);

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state("x"), Some(RunState::Idle));
    assert_eq!(snapshot.state("y"), Some(RunState::Idle));
    assert!(snapshot.refreshing.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failure_is_recorded_and_dependents_still_run() {
    let backend = Arc::new(ScriptedBackend::default().plan("r", [Plan::fail("boom")]));
    let sibling = Runnable::new("s")
        .with_field("rows", FieldConfiguration::connected("r", "result"))
        .with_field("upstream_error", FieldConfiguration::connected("r", "error"));
    let session = AppSession::new([Runnable::new("r"), sibling], Vec::new(), backend.clone(), config(0)).expect("session");
    let mut events = session.subscribe();
    let handle = session.start();

    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(100).await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    let error = snapshot.error("r").expect("error recorded");
    assert_eq!(error.id, Some(JobId::new("job-1")));
    assert!(error.error.contains("boom"));
    assert_eq!(snapshot.jobs_for("r")[0].status, JobStatus::Failed);

    let sibling_inputs = backend.dispatched_for("s");
    assert_eq!(sibling_inputs.len(), 1);
    assert_eq!(sibling_inputs[0]["rows"], Value::Null);
    assert_eq!(sibling_inputs[0]["upstream_error"], json!("job job-1 failed: boom"));
    assert!(snapshot.error("s").is_none());

    let notified = drain(&mut events).into_iter().find_map(|event| match event {
        SessionEvent::DependentsNotified { component, dependents, error } if component == "r" => Some((dependents, error)),
        _ => None,
    });
    let (dependents, error) = notified.expect("dependents notified");
    assert_eq!(dependents, vec!["s".to_string()]);
    assert_eq!(error.map(|error| error.id), Some(Some(JobId::new("job-1"))));
}

#[tokio::test(start_paused = true)]
async fn success_after_failure_clears_the_error() {
    let backend = Arc::new(ScriptedBackend::default().plan("r", [Plan::fail("boom"), Plan::ok(0, json!(1))]));
    let handle = AppSession::spawn([Runnable::new("r")], Vec::new(), backend, config(0)).expect("session");

    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(10).await;
    assert!(handle.snapshot().await.expect("snapshot").error("r").is_some());

    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(10).await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.error("r").is_none());
    assert!(snapshot.output("r", "error").is_none());
    assert_eq!(snapshot.output("r", "result"), Some(&json!(1)));
}

#[tokio::test(start_paused = true)]
async fn cancel_returns_immediately_and_discards_the_result() {
    let backend = Arc::new(ScriptedBackend::default().plan("r", [Plan::ok(100, json!("late")).stubborn()]));
    let handle = AppSession::spawn([Runnable::new("r")], Vec::new(), backend.clone(), config(0)).expect("session");

    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(10).await;
    assert!(handle.cancel("r").await.expect("cancel"));
    assert_eq!(handle.snapshot().await.expect("snapshot").state("r"), Some(RunState::Idle));

    advance(300).await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.output("r", "result").is_none());
    assert_eq!(snapshot.jobs_for("r")[0].status, JobStatus::Canceled);
    assert_eq!(backend.canceled.lock().unwrap().len(), 1);
    assert!(!handle.cancel("r").await.expect("cancel idle"));
}

#[tokio::test(start_paused = true)]
async fn removing_a_component_leaves_a_dangling_reference() {
    let backend = Arc::new(ScriptedBackend::default());
    let session = AppSession::new([reader("r", "a", "value")], components(&["a"]), backend.clone(), config(0)).expect("session");
    let mut events = session.subscribe();
    let handle = session.start();

    handle.set_component_output("a", "value", json!("x")).await.expect("set output");
    advance(10).await;
    handle
        .apply_editor_event(EditorEvent::ComponentRemoved("a".into()))
        .await
        .expect("remove component");

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.outputs.outputs_of("a").is_none());
    assert_eq!(snapshot.dangling_references.len(), 1);
    assert_eq!(snapshot.dangling_references[0].component_id, "a");
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        SessionEvent::DanglingReference { runnable, component_id, .. } if runnable == "r" && component_id == "a"
    )));

    handle
        .apply_editor_event(EditorEvent::ComponentAdded("a2".into()))
        .await
        .expect("add component");
    assert!(handle.component_changed("a2").await.expect("changed").is_empty());

    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(10).await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    let error = snapshot.error("r").expect("dangling reference recorded");
    assert_eq!(error.id, None);
    assert!(error.error.contains("'a'"));
    assert_eq!(backend.dispatched_for("r").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn removing_a_runnable_cancels_it_and_clears_its_state() {
    let backend = Arc::new(ScriptedBackend::default().plan("r", [Plan::ok(0, json!(1)), Plan::ok(100, json!(2)).stubborn()]));
    let session = AppSession::new([Runnable::new("r")], Vec::new(), backend.clone(), config(0)).expect("session");
    let mut events = session.subscribe();
    let handle = session.start();

    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(10).await;
    handle.trigger("r", TriggerCause::Manual).await.expect("trigger");
    advance(10).await;
    handle
        .apply_editor_event(EditorEvent::RunnableRemoved("r".into()))
        .await
        .expect("remove runnable");
    advance(300).await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.state("r").is_none());
    assert!(snapshot.outputs.outputs_of("r").is_none());
    assert!(snapshot.jobs.is_empty());
    assert!(drain(&mut events).iter().any(|event| matches!(event, SessionEvent::ResultDiscarded { .. })));
    assert!(handle.trigger("r", TriggerCause::Manual).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn switching_one_of_branch_adds_the_edge() {
    let one_of = |selected: &str| {
        FieldConfiguration::OneOf(OneOfConfiguration {
            selected: selected.into(),
            configuration: indexmap! {
                "x".to_string() => indexmap! { "value".to_string() => FieldConfiguration::static_value(json!("fixed")) },
                "y".to_string() => indexmap! { "value".to_string() => FieldConfiguration::connected("c", "value") },
            },
            ..Default::default()
        })
    };
    let runnable = Runnable::new("r").with_field("source", one_of("x"));
    let backend = Arc::new(ScriptedBackend::default());
    let handle = AppSession::spawn([runnable.clone()], components(&["c"]), backend.clone(), config(0)).expect("session");

    assert!(handle.component_changed("c").await.expect("changed").is_empty());

    handle
        .apply_editor_event(EditorEvent::FieldChanged(runnable.with_field("source", one_of("y"))))
        .await
        .expect("edit");
    handle.set_component_output("c", "value", json!("picked")).await.expect("set output");
    advance(10).await;

    let dispatched = backend.dispatched_for("r");
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0]["source"], json!({"selected": "y", "configuration": {"value": "picked"}}));
}

#[tokio::test(start_paused = true)]
async fn added_runnables_join_the_graph() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = AppSession::spawn(Vec::<Runnable>::new(), components(&["a"]), backend.clone(), config(0)).expect("session");

    handle
        .apply_editor_event(EditorEvent::RunnableAdded(reader("r", "a", "value")))
        .await
        .expect("add");
    assert!(
        handle
            .apply_editor_event(EditorEvent::RunnableAdded(Runnable::new("r")))
            .await
            .is_err()
    );
    assert_eq!(handle.component_changed("a").await.expect("changed"), vec!["r".to_string()]);
    assert!(
        handle
            .apply_editor_event(EditorEvent::FieldChanged(Runnable::new("ghost")))
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn subscribers_can_follow_a_single_component() {
    let backend = Arc::new(ScriptedBackend::default());
    let session = AppSession::new(
        [reader("r", "a", "value"), reader("s", "b", "value")],
        components(&["a", "b"]),
        backend,
        config(0),
    )
    .expect("session");
    let mut only_s = session.handle().subscribe_to("s");
    let handle = session.start();

    handle.set_component_output("a", "value", json!(1)).await.expect("set a");
    handle.set_component_output("b", "value", json!(1)).await.expect("set b");
    advance(10).await;

    let events = drain(&mut only_s);
    assert!(!events.is_empty());
    assert!(events.iter().all(|event| event.subject() == "s"));
}
