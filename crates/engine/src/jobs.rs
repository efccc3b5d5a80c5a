//! Job result store (`jobsById` plus the per-component `jobs` history).

use std::collections::VecDeque;

use indexmap::IndexMap;
use runboard_types::{JobId, JobRecord, JobUpdate};
use tracing::debug;

/// Default number of jobs retained per component.
pub const DEFAULT_JOB_HISTORY_LIMIT: usize = 20;

/// Stores job records and merges partial updates as the backend reports them.
#[derive(Debug, Clone)]
pub struct JobResultStore {
    by_id: IndexMap<JobId, JobRecord>,
    /// Component -> its job IDs, oldest first.
    by_component: IndexMap<String, VecDeque<JobId>>,
    history_limit: usize,
}

impl Default for JobResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_HISTORY_LIMIT)
    }
}

impl JobResultStore {
    /// A limit of zero is treated as one; the latest job is always kept.
    pub fn new(history_limit: usize) -> Self {
        Self {
            by_id: IndexMap::new(),
            by_component: IndexMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Merges `update` into the record of `job_id`, creating it for `component` when absent.
    pub fn record(&mut self, job_id: &JobId, component: &str, update: JobUpdate) -> &JobRecord {
        if !self.by_id.contains_key(job_id) {
            self.by_id.insert(job_id.clone(), JobRecord::new(job_id.clone(), component));
            let history = self.by_component.entry(component.to_string()).or_default();
            history.push_back(job_id.clone());
            while history.len() > self.history_limit {
                if let Some(evicted) = history.pop_front() {
                    debug!(component, job_id = %evicted, "evicting job from history");
                    self.by_id.shift_remove(&evicted);
                }
            }
        }
        let record = self.by_id.entry(job_id.clone()).or_insert_with(|| JobRecord::new(job_id.clone(), component));
        record.apply(update);
        record
    }

    /// Merges `update` into an existing record only. Late updates for evicted or unknown jobs
    /// are dropped so they cannot push newer jobs out of the history.
    pub fn update_existing(&mut self, job_id: &JobId, update: JobUpdate) -> Option<&JobRecord> {
        let Some(record) = self.by_id.get_mut(job_id) else {
            debug!(job_id = %job_id, "dropping update for a job no longer retained");
            return None;
        };
        record.apply(update);
        Some(record)
    }

    pub fn get(&self, job_id: &JobId) -> Option<&JobRecord> {
        self.by_id.get(job_id)
    }

    /// Removes every record tied to a deleted component.
    pub fn clear(&mut self, component: &str) -> usize {
        let Some(history) = self.by_component.shift_remove(component) else {
            return 0;
        };
        history.iter().filter(|job_id| self.by_id.shift_remove(*job_id).is_some()).count()
    }

    /// Jobs of a component, oldest first.
    pub fn jobs_for(&self, component: &str) -> Vec<&JobRecord> {
        self.by_component
            .get(component)
            .map(|history| history.iter().filter_map(|job_id| self.by_id.get(job_id)).collect())
            .unwrap_or_default()
    }

    pub fn latest_for(&self, component: &str) -> Option<&JobRecord> {
        let job_id = self.by_component.get(component)?.back()?;
        self.by_id.get(job_id)
    }

    /// Every retained job ID, in dispatch order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.by_id.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runboard_types::JobStatus;
    use serde_json::json;

    #[test]
    fn record_creates_then_merges() {
        let mut store = JobResultStore::default();
        let job = JobId::new("j1");

        store.record(&job, "r", JobUpdate::created(Utc::now()));
        store.record(&job, "r", JobUpdate::succeeded(json!([1, 2]), Some(5)));

        let record = store.get(&job).expect("record");
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result, Some(json!([1, 2])));
        assert!(record.created_at.is_some());
        assert_eq!(store.jobs_for("r").len(), 1);
    }

    #[test]
    fn clear_removes_component_jobs_only() {
        let mut store = JobResultStore::default();
        store.record(&JobId::new("j1"), "r", JobUpdate::default());
        store.record(&JobId::new("j2"), "r", JobUpdate::default());
        store.record(&JobId::new("j3"), "s", JobUpdate::default());

        assert_eq!(store.clear("r"), 2);
        assert!(store.get(&JobId::new("j1")).is_none());
        assert!(store.get(&JobId::new("j3")).is_some());
        assert_eq!(store.clear("r"), 0);
    }

    #[test]
    fn late_update_for_evicted_job_keeps_newer_history() {
        let mut store = JobResultStore::new(1);
        store.record(&JobId::new("j1"), "r", JobUpdate::created(Utc::now()));
        store.record(&JobId::new("j2"), "r", JobUpdate::succeeded(json!(2), None));

        assert!(store.update_existing(&JobId::new("j1"), JobUpdate::canceled()).is_none());
        let ids: Vec<&str> = store.jobs_for("r").iter().map(|record| record.job.as_str()).collect();
        assert_eq!(ids, vec!["j2"]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&JobId::new("j2")).map(|record| record.status), Some(JobStatus::Succeeded));
    }

    #[test]
    fn history_limit_evicts_oldest() {
        let mut store = JobResultStore::new(2);
        for index in 0..3 {
            store.record(&JobId::new(format!("j{index}")), "r", JobUpdate::default());
        }

        assert!(store.get(&JobId::new("j0")).is_none());
        let ids: Vec<&str> = store.jobs_for("r").iter().map(|record| record.job.as_str()).collect();
        assert_eq!(ids, vec!["j1", "j2"]);
        assert_eq!(store.latest_for("r").map(|record| record.job.as_str()), Some("j2"));
    }
}
