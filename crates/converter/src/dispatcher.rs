use std::path::PathBuf;
use log::{error, info};
use tokio::sync::mpsc;
use uuid::Uuid;
use crate::engine::TranscodeEngine;
use crate::job::{Job, JobOutcome};
use crate::progress::Progress;
use crate::task::ConversionTask;

/// Messages from the dispatcher to the controller
#[derive(Debug)]
pub enum DispatcherEvent {
    /// Latest progress of the running conversion, or the idle snapshot
    Progress(Progress),
    /// A job left the dispatcher
    Finished { job_id: Uuid, path: PathBuf, outcome: JobOutcome },
}

/// Counts of job outcomes over the dispatcher's lifetime
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Single worker that runs queued jobs strictly one at a time.
///
/// Runs until the job queue is closed and empty. Dropping the dispatcher
/// closes the event channel, which tells the controller it has drained.
pub struct Dispatcher<E: TranscodeEngine> {
    task: ConversionTask<E>,
    jobs: mpsc::Receiver<Job>,
    events: mpsc::Sender<DispatcherEvent>,
}

impl<E: TranscodeEngine> Dispatcher<E> {
    pub fn new(
        task: ConversionTask<E>,
        jobs: mpsc::Receiver<Job>,
        events: mpsc::Sender<DispatcherEvent>,
    ) -> Self {
        Self { task, jobs, events }
    }

    pub async fn run(mut self) -> DispatchStats {
        info!("Dispatcher started");
        let mut stats = DispatchStats::default();

        while let Some(job) = self.jobs.recv().await {
            let outcome = if job.is_cancelled() {
                JobOutcome::Cancelled
            } else {
                info!("Converting file: {}", job.input_path.display());
                let outcome = self.task.run(&job, &self.events).await;
                // Mark the job done
                job.cancel.cancel();
                outcome
            };

            match &outcome {
                JobOutcome::Completed => {
                    stats.completed += 1;
                    info!("Conversion complete: {}", job.input_path.display());
                }
                JobOutcome::Cancelled => {
                    stats.cancelled += 1;
                    info!("Conversion cancelled: {}", job.input_path.display());
                }
                JobOutcome::Failed(e) => {
                    stats.failed += 1;
                    error!("Error converting file {} ({}): {}", job.input_path.display(), e.kind(), e);
                }
            }

            // The controller may already be gone during shutdown; keep draining regardless
            let _ = self
                .events
                .send(DispatcherEvent::Finished { job_id: job.id, path: job.input_path.clone(), outcome })
                .await;
            let _ = self.events.send(DispatcherEvent::Progress(Progress::idle())).await;
        }

        info!(
            "Dispatcher drained: {} completed, {} cancelled, {} failed",
            stats.completed, stats.cancelled, stats.failed
        );
        stats
    }
}
