use std::future::Future;
use std::sync::Arc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use crate::broker::BrokerEndpoint;
use crate::config::ConverterConfig;
use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherEvent};
use crate::engine::TranscodeEngine;
use crate::error::ConvertError;
use crate::job::{Job, JobTable};
use crate::progress::Progress;
use crate::scan::{self, WatchedSet};
use crate::server::StatusServer;
use crate::task::{ConversionTask, ReadinessPolicy};

/// Buffered dispatcher events; progress arrives a few times per second at most
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Terminated,
}

/// Summary returned after a clean shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerReport {
    pub stats: DispatchStats,
    /// Entries left in the job table; zero after a graceful shutdown
    pub jobs_remaining: usize,
}

/// Top-level loop: owns the job table and the cached progress snapshot,
/// feeds the dispatcher and answers progress requests.
pub struct Controller<E: TranscodeEngine> {
    config: ConverterConfig,
    engine: Arc<E>,
    broker: BrokerEndpoint,
    readiness: ReadinessPolicy,
}

impl<E: TranscodeEngine> Controller<E> {
    pub fn new(config: ConverterConfig, engine: Arc<E>, broker: BrokerEndpoint) -> Self {
        let readiness = ReadinessPolicy::from_config(&config);
        Self { config, engine, broker, readiness }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Run until `shutdown` resolves or the watched directory becomes unreadable.
    ///
    /// On the way out every job is cancelled, the dispatcher is drained, the
    /// broker is closed and `server` (if any) is stopped.
    pub async fn run<F>(self, server: Option<StatusServer>, shutdown: F) -> Result<ControllerReport, ConvertError>
    where
        F: Future<Output = ()>,
    {
        let Controller { config, engine, mut broker, readiness } = self;

        let (job_tx, job_rx) = mpsc::channel::<Job>(config.queue_capacity);
        let (event_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = ConversionTask::new(engine, &config).with_readiness(readiness);
        let dispatcher = tokio::spawn(Dispatcher::new(task, job_rx, event_tx).run());

        let mut table = JobTable::new();
        let mut progress = Progress::idle();
        let mut queue = Some(job_tx);
        let mut fatal: Option<ConvertError> = None;
        let mut state = LifecycleState::Running;
        tokio::pin!(shutdown);

        info!("Watching {} for new files", config.watch_dir.display());

        while state == LifecycleState::Running {
            match scan::scan_directory(&config.watch_dir) {
                Ok(watched) => reconcile_jobs(&watched, &mut table, queue.as_ref()),
                Err(e) => {
                    error!("{}", e);
                    fatal = Some(e);
                    begin_shutdown(&mut table, &mut queue);
                    state = LifecycleState::Draining;
                    continue;
                }
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => apply_event(event, &mut table, &mut progress),
                    None => {
                        warn!("Dispatcher stopped unexpectedly");
                        begin_shutdown(&mut table, &mut queue);
                        state = LifecycleState::Draining;
                    }
                },
                Some(request) = broker.recv() => request.reply(progress.clone()),
                _ = &mut shutdown => {
                    info!("Termination requested");
                    begin_shutdown(&mut table, &mut queue);
                    state = LifecycleState::Draining;
                }
                _ = tokio::time::sleep(config.poll_interval()) => {}
            }
        }

        info!("Draining: waiting for the dispatcher to finish");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(DispatcherEvent::Finished { path, outcome, .. }) => {
                        debug!("Drained {}: {:?}", path.display(), outcome.kind());
                    }
                    Some(DispatcherEvent::Progress(_)) => {}
                    None => break,
                },
                Some(request) = broker.recv() => request.reply(Progress::idle()),
            }
        }

        let stats = match dispatcher.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Dispatcher task failed: {}", e);
                DispatchStats::default()
            }
        };

        state = LifecycleState::Terminated;
        debug!("Controller state: {:?}", state);

        let answered = broker.close_and_drain();
        if answered > 0 {
            debug!("Answered {} final progress request(s) with the idle snapshot", answered);
        }

        let transport = match server {
            Some(server) => server.stop(config.shutdown_timeout()).await,
            None => Ok(()),
        };

        if let Some(e) = fatal {
            if let Err(transport_err) = transport {
                error!("{}", transport_err);
            }
            return Err(e);
        }
        transport?;

        info!("Application terminated successfully");
        Ok(ControllerReport { stats, jobs_remaining: table.len() })
    }
}

/// Fold a dispatcher event into the cached snapshot and the job table
fn apply_event(event: DispatcherEvent, table: &mut JobTable, progress: &mut Progress) {
    match event {
        DispatcherEvent::Progress(update) => *progress = update,
        DispatcherEvent::Finished { job_id, path, outcome } => {
            // Nothing is converting until the dispatcher reports otherwise
            *progress = Progress::idle();
            let size = std::fs::metadata(&path).ok().map(|m| m.len());
            if table.finish(job_id, &path, outcome.kind(), size) {
                debug!("Job {} for {} finished: {:?}", job_id, path.display(), outcome.kind());
            }
        }
    }
}

/// Cancel vanished files, register and enqueue new ones.
///
/// Never blocks: when the queue is full the remaining files wait for a later scan.
fn reconcile_jobs(watched: &WatchedSet, table: &mut JobTable, queue: Option<&mpsc::Sender<Job>>) {
    let delta = scan::reconcile(watched, table);

    for path in &delta.removed {
        if table.is_live(path) {
            info!("File removed, cancelling conversion: {}", path.display());
        }
        table.cancel_and_remove(path);
    }

    let Some(queue) = queue else {
        return;
    };

    for path in delta.new {
        let permit = match queue.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                debug!("Job queue full, deferring {}", path.display());
                break;
            }
            Err(TrySendError::Closed(())) => break,
        };

        let (job, created) = table.register(&path);
        if created {
            info!("New file found: {}", path.display());
            permit.send(job);
        }
    }
}

/// Cancel every job and close the dispatcher queue. Safe to call twice.
fn begin_shutdown(table: &mut JobTable, queue: &mut Option<mpsc::Sender<Job>>) {
    let cancelled = table.cancel_all();
    if queue.take().is_some() {
        info!("Cancelled {} job(s), closing the job queue", cancelled);
    }
}
