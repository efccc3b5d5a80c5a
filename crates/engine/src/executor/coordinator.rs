//! Per-runnable run state machine.
//!
//! `Idle -> Queued -> Running -> (Succeeded | Failed | Canceled) -> Idle`
//!
//! The coordinator only does bookkeeping: it decides which run may start, which in-flight run
//! is superseded and whether a completion is still current. Timers and job execution belong
//! to the session, which feeds their outcomes back in.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use runboard_types::JobId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic identifier of a run, unique within a session.
pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunState {
    /// Queued or running.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Queued | RunState::Running)
    }
}

/// Why a runnable was triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCause {
    Manual,
    Startup,
    /// A component the runnable reads from changed.
    Dependency { component: String },
    /// A finished runnable listed this one in its `recomputeIds`.
    Recompute { source: String },
    AutoRefresh,
    RefreshAll,
}

/// In-flight run of a runnable.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub cause: TriggerCause,
    pub token: CancellationToken,
    pub job_id: Option<JobId>,
    /// Runnables already run earlier in the refresh cascade that led to this run.
    pub lineage: BTreeSet<String>,
}

/// Run handed to the session for execution.
#[derive(Debug, Clone)]
pub struct StartedRun {
    pub runnable: String,
    pub run_id: RunId,
    pub cause: TriggerCause,
    pub token: CancellationToken,
    pub lineage: BTreeSet<String>,
}

/// Result of [`Coordinator::trigger`].
#[derive(Debug, Clone)]
pub struct TriggerDecision {
    /// Debounce generation the pending run waits for.
    pub generation: u64,
    /// Runs superseded by this trigger; their tokens are already canceled.
    pub superseded: Vec<ActiveRun>,
    /// The trigger merged into a run that was already queued.
    pub coalesced: bool,
}

/// Whether a reported completion is applied or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionVerdict {
    Apply,
    /// The run was superseded or canceled; its result must not touch session state.
    Discard,
}

/// How a run ended, as reported to [`Coordinator::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Canceled,
}

impl From<RunOutcome> for RunState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => RunState::Succeeded,
            RunOutcome::Failed => RunState::Failed,
            RunOutcome::Canceled => RunState::Canceled,
        }
    }
}

/// State change of one runnable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub runnable: String,
    pub from: RunState,
    pub to: RunState,
}

#[derive(Debug, Clone, Default)]
struct RunSlot {
    state: RunState,
    allow_concurrent: bool,
    pending: Option<TriggerCause>,
    /// Cascade lineage handed to the pending run.
    pending_lineage: BTreeSet<String>,
    /// Bumped on every trigger and cancel; only the latest debounce timer may start a run.
    generation: u64,
    /// Bumped whenever the auto-refresh timer is re-armed.
    timer_generation: u64,
    active: Vec<ActiveRun>,
    latest_applied: Option<RunId>,
    last_outcome: Option<RunState>,
}

/// Bookkeeping for every runnable of a session.
#[derive(Debug, Default)]
pub struct Coordinator {
    slots: IndexMap<String, RunSlot>,
    next_run_id: RunId,
    transitions: Vec<Transition>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runnable, keeping its current run state when it is already known.
    pub fn register(&mut self, runnable: &str, allow_concurrent: bool) {
        self.slots.entry(runnable.to_string()).or_default().allow_concurrent = allow_concurrent;
    }

    /// Forgets a runnable, canceling whatever it had in flight.
    pub fn remove(&mut self, runnable: &str) -> Vec<ActiveRun> {
        let Some(slot) = self.slots.shift_remove(runnable) else {
            return Vec::new();
        };
        for run in &slot.active {
            run.token.cancel();
        }
        slot.active
    }

    pub fn contains(&self, runnable: &str) -> bool {
        self.slots.contains_key(runnable)
    }

    /// Queues a run. Unless concurrent runs are allowed, in-flight runs are canceled first.
    ///
    /// Returns `None` for unknown runnables.
    pub fn trigger(&mut self, runnable: &str, cause: TriggerCause) -> Option<TriggerDecision> {
        self.trigger_in_cascade(runnable, cause, BTreeSet::new())
    }

    /// Like [`Coordinator::trigger`], for a run caused by the completion of other runnables.
    ///
    /// An empty `lineage` starts a new cascade and resets the lineage of a pending run.
    pub fn trigger_in_cascade(&mut self, runnable: &str, cause: TriggerCause, lineage: BTreeSet<String>) -> Option<TriggerDecision> {
        let slot = self.slots.get_mut(runnable)?;

        let superseded = if slot.allow_concurrent {
            Vec::new()
        } else {
            let superseded: Vec<ActiveRun> = slot.active.drain(..).collect();
            for run in &superseded {
                debug!(runnable, run_id = run.run_id, "superseding in-flight run");
                run.token.cancel();
            }
            superseded
        };

        let coalesced = slot.pending.is_some();
        if !coalesced || lineage.is_empty() {
            slot.pending_lineage = lineage;
        } else {
            slot.pending_lineage.extend(lineage);
        }
        slot.pending = Some(cause);
        slot.generation += 1;
        let generation = slot.generation;
        Self::transition(&mut self.transitions, runnable, slot, RunState::Queued);

        Some(TriggerDecision {
            generation,
            superseded,
            coalesced,
        })
    }

    /// Starts the pending run once the debounce window of `generation` has elapsed.
    ///
    /// Stale generations (a newer trigger or a cancel happened since) start nothing.
    pub fn start_pending(&mut self, runnable: &str, generation: u64) -> Option<StartedRun> {
        let slot = self.slots.get_mut(runnable)?;
        if slot.generation != generation {
            return None;
        }
        let cause = slot.pending.take()?;
        let lineage = std::mem::take(&mut slot.pending_lineage);

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let token = CancellationToken::new();
        slot.active.push(ActiveRun {
            run_id,
            cause: cause.clone(),
            token: token.clone(),
            job_id: None,
            lineage: lineage.clone(),
        });
        Self::transition(&mut self.transitions, runnable, slot, RunState::Running);

        Some(StartedRun {
            runnable: runnable.to_string(),
            run_id,
            cause,
            token,
            lineage,
        })
    }

    /// Associates the job assigned by the backend with an active run.
    ///
    /// Returns `false` when the run is no longer active.
    pub fn attach_job(&mut self, runnable: &str, run_id: RunId, job_id: JobId) -> bool {
        let Some(run) = self
            .slots
            .get_mut(runnable)
            .and_then(|slot| slot.active.iter_mut().find(|run| run.run_id == run_id))
        else {
            return false;
        };
        run.job_id = Some(job_id);
        true
    }

    /// Cascade lineage of an active run; empty when the run is unknown.
    pub fn lineage_of(&self, runnable: &str, run_id: RunId) -> BTreeSet<String> {
        self.slots
            .get(runnable)
            .and_then(|slot| slot.active.iter().find(|run| run.run_id == run_id))
            .map(|run| run.lineage.clone())
            .unwrap_or_default()
    }

    /// Decides whether the completion of `run_id` is still current and settles the state.
    pub fn complete(&mut self, runnable: &str, run_id: RunId, outcome: RunOutcome) -> CompletionVerdict {
        let Some(slot) = self.slots.get_mut(runnable) else {
            return CompletionVerdict::Discard;
        };
        let Some(position) = slot.active.iter().position(|run| run.run_id == run_id) else {
            return CompletionVerdict::Discard;
        };
        slot.active.remove(position);
        // With concurrent runs, an older run finishing after a newer one must not win.
        let verdict = if slot.latest_applied.is_some_and(|latest| latest > run_id) {
            CompletionVerdict::Discard
        } else {
            slot.latest_applied = Some(run_id);
            slot.last_outcome = Some(RunState::from(outcome));
            CompletionVerdict::Apply
        };

        if slot.active.is_empty() && slot.pending.is_none() {
            let finished = slot.last_outcome.unwrap_or(RunState::from(outcome));
            Self::transition(&mut self.transitions, runnable, slot, finished);
            Self::transition(&mut self.transitions, runnable, slot, RunState::Idle);
        }
        verdict
    }

    /// Cancels the pending and in-flight runs of a runnable. Returns immediately; the canceled
    /// runs may still report back and are then discarded.
    pub fn cancel(&mut self, runnable: &str) -> Vec<ActiveRun> {
        let Some(slot) = self.slots.get_mut(runnable) else {
            return Vec::new();
        };
        if !slot.state.is_active() {
            return Vec::new();
        }

        slot.pending = None;
        slot.pending_lineage.clear();
        slot.generation += 1;
        let canceled: Vec<ActiveRun> = slot.active.drain(..).collect();
        for run in &canceled {
            run.token.cancel();
        }
        slot.last_outcome = Some(RunState::Canceled);
        Self::transition(&mut self.transitions, runnable, slot, RunState::Canceled);
        Self::transition(&mut self.transitions, runnable, slot, RunState::Idle);
        canceled
    }

    /// Re-arms the auto-refresh timer of a runnable, invalidating the previous one.
    pub fn reset_timer(&mut self, runnable: &str) -> Option<u64> {
        let slot = self.slots.get_mut(runnable)?;
        slot.timer_generation += 1;
        Some(slot.timer_generation)
    }

    /// Whether a fired auto-refresh timer is still the current one.
    pub fn timer_is_current(&self, runnable: &str, timer_generation: u64) -> bool {
        self.slots
            .get(runnable)
            .is_some_and(|slot| slot.timer_generation == timer_generation)
    }

    pub fn state(&self, runnable: &str) -> Option<RunState> {
        self.slots.get(runnable).map(|slot| slot.state)
    }

    pub fn last_outcome(&self, runnable: &str) -> Option<RunState> {
        self.slots.get(runnable).and_then(|slot| slot.last_outcome)
    }

    pub fn active_runs(&self, runnable: &str) -> &[ActiveRun] {
        self.slots.get(runnable).map(|slot| slot.active.as_slice()).unwrap_or_default()
    }

    /// Runnables that are queued or running, in registration order.
    pub fn refreshing(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state.is_active())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn states(&self) -> impl Iterator<Item = (&String, RunState)> {
        self.slots.iter().map(|(name, slot)| (name, slot.state))
    }

    /// Transitions recorded since the last call.
    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    fn transition(transitions: &mut Vec<Transition>, runnable: &str, slot: &mut RunSlot, to: RunState) {
        if slot.state == to {
            return;
        }
        debug!(runnable, from = ?slot.state, to = ?to, "run state transition");
        transitions.push(Transition {
            runnable: runnable.to_string(),
            from: slot.state,
            to,
        });
        slot.state = to;
    }
}
