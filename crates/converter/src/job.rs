use std::collections::HashMap;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::error::ConvertError;

/// One pending or active conversion
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub input_path: PathBuf,
    /// Cooperative cancellation handle, shared with the dispatcher and the engine
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(input_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_path,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// File name for log lines and progress snapshots
    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }
}

/// Terminal outcome of a conversion
#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed(ConvertError),
}

impl JobOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            JobOutcome::Completed => OutcomeKind::Completed,
            JobOutcome::Cancelled => OutcomeKind::Cancelled,
            JobOutcome::Failed(_) => OutcomeKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Completed,
    Cancelled,
    Failed,
}

/// A path whose job has reached a terminal outcome while the file is still on disk
#[derive(Debug, Clone)]
pub struct FinishedEntry {
    pub job_id: Uuid,
    pub outcome: OutcomeKind,
    /// Size of the input when the job finished, if it could be read
    pub size: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

/// Deduplicating registry of discovered files.
///
/// Owned by the controller task and never shared, so it needs no locking.
/// At most one live job exists per path. Paths whose job finished are kept
/// as finished entries until the file disappears, so a converted file is not
/// picked up again on the next scan.
#[derive(Debug, Default)]
pub struct JobTable {
    live: HashMap<PathBuf, Job>,
    finished: HashMap<PathBuf, FinishedEntry>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job for `path` unless one is already live.
    ///
    /// Returns the live job and whether it was created by this call.
    pub fn register(&mut self, path: &Path) -> (Job, bool) {
        if let Some(existing) = self.live.get(path) {
            return (existing.clone(), false);
        }

        self.finished.remove(path);
        let job = Job::new(path.to_path_buf());
        debug!("Registered job {} for {}", job.id, path.display());
        self.live.insert(path.to_path_buf(), job.clone());
        (job, true)
    }

    /// Whether a file seen by the scanner should get a new job.
    ///
    /// Completed and cancelled paths stay done while they remain on disk;
    /// a failed path becomes eligible again once its size changes.
    pub fn needs_job(&self, path: &Path, size: u64) -> bool {
        if self.live.contains_key(path) {
            return false;
        }
        match self.finished.get(path) {
            None => true,
            Some(entry) => entry.outcome == OutcomeKind::Failed && entry.size != Some(size),
        }
    }

    /// Cancel the live job for `path` and forget the path. No-op for unknown paths.
    pub fn cancel_and_remove(&mut self, path: &Path) -> bool {
        let mut removed = false;
        if let Some(job) = self.live.remove(path) {
            job.cancel.cancel();
            debug!("Cancelled job {} for {}", job.id, path.display());
            removed = true;
        }
        if self.finished.remove(path).is_some() {
            removed = true;
        }
        removed
    }

    /// Cancel every live job and clear the table. Returns the number of live jobs cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.live.len();
        for job in self.live.values() {
            job.cancel.cancel();
        }
        self.live.clear();
        self.finished.clear();
        count
    }

    /// Move the live job `job_id` for `path` into the finished set.
    ///
    /// Ignored when the path was removed meanwhile or now belongs to a newer job.
    pub fn finish(&mut self, job_id: Uuid, path: &Path, outcome: OutcomeKind, size: Option<u64>) -> bool {
        match self.live.get(path) {
            Some(job) if job.id == job_id => {
                self.live.remove(path);
                self.finished.insert(
                    path.to_path_buf(),
                    FinishedEntry { job_id, outcome, size, finished_at: Utc::now() },
                );
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.live.contains_key(path) || self.finished.contains_key(path)
    }

    pub fn is_live(&self, path: &Path) -> bool {
        self.live.contains_key(path)
    }

    pub fn get_finished(&self, path: &Path) -> Option<&FinishedEntry> {
        self.finished.get(path)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn len(&self) -> usize {
        self.live.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.finished.is_empty()
    }

    /// Every tracked path, live or finished
    pub fn paths(&self) -> Vec<PathBuf> {
        self.live.keys().chain(self.finished.keys()).cloned().collect()
    }
}
