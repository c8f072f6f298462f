use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::ConverterConfig;
use crate::dispatcher::DispatcherEvent;
use crate::engine::{EngineExit, EngineRun, TranscodeEngine};
use crate::error::ConvertError;
use crate::job::{Job, JobOutcome};
use crate::progress::Progress;

/// How long to wait for an upstream copy to finish before converting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Delay between two size samples
    pub interval: Duration,
    /// Fail the job if the size is still changing after this long
    pub timeout: Duration,
}

impl ReadinessPolicy {
    pub fn from_config(config: &ConverterConfig) -> Self {
        Self {
            interval: config.stable_check_interval(),
            timeout: config.copy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Two consecutive samples matched; holds the final size
    Stable(u64),
    Cancelled,
}

/// Poll the size of `path` until two consecutive non-zero samples match.
pub async fn wait_until_stable(
    path: &Path,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<Readiness, ConvertError> {
    // No deadline if the timeout does not fit in an Instant
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut previous: Option<u64> = None;

    loop {
        if cancel.is_cancelled() {
            return Ok(Readiness::Cancelled);
        }

        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            // A vanished file is a removal; the scanner cancels its job shortly after
            Err(_) if cancel.is_cancelled() => return Ok(Readiness::Cancelled),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} disappeared while waiting for it to settle", path.display());
                return Ok(Readiness::Cancelled);
            }
            Err(source) => return Err(ConvertError::Stat { path: path.to_path_buf(), source }),
        };

        if size > 0 && previous == Some(size) {
            return Ok(Readiness::Stable(size));
        }
        previous = Some(size);

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ConvertError::CopyTimeout { path: path.to_path_buf(), waited: policy.timeout });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(Readiness::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

/// Converts a single file: waits for it to settle, runs the engine and
/// relays its progress.
pub struct ConversionTask<E: TranscodeEngine> {
    engine: Arc<E>,
    readiness: ReadinessPolicy,
    output_dir: PathBuf,
    codec_args: Vec<String>,
}

impl<E: TranscodeEngine> ConversionTask<E> {
    pub fn new(engine: Arc<E>, config: &ConverterConfig) -> Self {
        Self {
            engine,
            readiness: ReadinessPolicy::from_config(config),
            output_dir: config.output_dir.clone(),
            codec_args: config.codec_args(),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    fn output_path(&self, input: &Path) -> PathBuf {
        match input.file_name() {
            Some(name) => self.output_dir.join(name),
            None => self.output_dir.join("output.mp4"),
        }
    }

    /// Run the job to a terminal outcome. Progress snapshots go to `sink`.
    pub async fn run(&self, job: &Job, sink: &mpsc::Sender<DispatcherEvent>) -> JobOutcome {
        let file_name = job.file_name();

        match wait_until_stable(&job.input_path, self.readiness, &job.cancel).await {
            Ok(Readiness::Stable(size)) => debug!("{} is stable at {} bytes", file_name, size),
            Ok(Readiness::Cancelled) => return JobOutcome::Cancelled,
            Err(e) => return JobOutcome::Failed(e),
        }

        // The file may have been removed while we were waiting
        if job.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let output = self.output_path(&job.input_path);
        info!("Converting {} -> {}", job.input_path.display(), output.display());

        let EngineRun { progress, errors, done } =
            match self.engine.start(job.cancel.clone(), &job.input_path, &output, &self.codec_args) {
                Ok(run) => run,
                Err(e) => return JobOutcome::Failed(e),
            };

        let relay = tokio::spawn(relay_events(file_name.clone(), progress, errors, sink.clone()));

        let exit = done.await;
        if let Err(e) = relay.await {
            warn!("Progress relay for {} failed: {}", file_name, e);
        }

        match exit {
            Ok(EngineExit::Finished) => JobOutcome::Completed,
            Ok(EngineExit::Cancelled) => JobOutcome::Cancelled,
            Ok(EngineExit::Failed(e)) => JobOutcome::Failed(e),
            Err(_) => JobOutcome::Failed(ConvertError::EngineRun(
                "transcoder stopped without reporting a result".to_string(),
            )),
        }
    }
}

/// Forward engine progress to the dispatcher sink; parse errors are only logged
async fn relay_events(
    file_name: String,
    mut progress: mpsc::Receiver<Progress>,
    mut errors: mpsc::Receiver<ConvertError>,
    sink: mpsc::Sender<DispatcherEvent>,
) {
    let mut progress_open = true;
    let mut errors_open = true;

    while progress_open || errors_open {
        tokio::select! {
            update = progress.recv(), if progress_open => match update {
                // Keep draining even if nobody listens, so the engine never stalls
                Some(p) => { let _ = sink.send(DispatcherEvent::Progress(p)).await; }
                None => progress_open = false,
            },
            err = errors.recv(), if errors_open => match err {
                Some(e) => warn!("{}: {}", file_name, e),
                None => errors_open = false,
            },
        }
    }
}
