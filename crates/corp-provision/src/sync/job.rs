//! Sync jobs and the in-process job registry.

use super::result::TableSyncResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Snapshot of one sync job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: Uuid,
    /// `host,port/database`
    pub source: String,
    pub target: String,
    pub total_tables: usize,
    pub completed_tables: usize,
    pub current_table: Option<String>,
    pub status: JobStatus,
    pub results: Vec<TableSyncResult>,
    /// Constraint bracket and link-test problems that did not fail a table.
    pub warnings: Vec<String>,
    /// Job-level error, e.g. a driver that could not be built.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new(source: impl Into<String>, target: impl Into<String>, total_tables: usize) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source: source.into(),
            target: target.into(),
            total_tables,
            completed_tables: 0,
            current_table: None,
            status: JobStatus::Pending,
            results: Vec::new(),
            warnings: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Whole-number percentage of tables processed.
    pub fn progress_percent(&self) -> u8 {
        if self.total_tables == 0 {
            return 0;
        }
        ((self.completed_tables * 100) / self.total_tables).min(100) as u8
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }

    /// Record a finished table and advance the counter.
    pub(crate) fn push_result(&mut self, result: TableSyncResult) {
        self.results.push(result);
        self.completed_tables = self.results.len().min(self.total_tables);
    }
}

struct Entry {
    job: SyncJob,
    cancel: CancellationToken,
}

/// Jobs by id.
///
/// Each job is written only by the worker that runs it; any caller may
/// read a snapshot or request cancellation. Finished jobs stay until
/// [`JobRegistry::cleanup_finished`] removes them.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and return its cancellation token.
    pub fn insert(&self, job: SyncJob) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            job.job_id,
            Entry {
                job,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn get(&self, id: Uuid) -> Option<SyncJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(&id).map(|e| e.job.clone())
    }

    /// Apply `f` to the job in place. Returns false for unknown ids.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut SyncJob)) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&id) {
            Some(entry) => {
                f(&mut entry.job);
                true
            }
            None => false,
        }
    }

    /// Every job, newest first.
    pub fn list(&self) -> Vec<SyncJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<SyncJob> = jobs.values().map(|e| e.job.clone()).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Ask a running or pending job to stop before its next table.
    ///
    /// Returns false when the job is unknown or already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        match jobs.get(&id) {
            Some(entry) if !entry.job.status.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Remove finished jobs whose `finished_at` is before `older_than`.
    /// Returns how many were removed.
    pub fn cleanup_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, e| {
            !(e.job.status.is_terminal()
                && e.job.finished_at.is_some_and(|t| t < older_than))
        });
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
