use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use crate::config::ConverterConfig;
use crate::error::ConvertError;
use crate::ffprobe;
use crate::progress::{Progress, ProgressParser};

/// Lines of ffmpeg stderr kept for failure messages
const STDERR_TAIL_LINES: usize = 20;

/// How a transcoder process ended
#[derive(Debug)]
pub enum EngineExit {
    Finished,
    Cancelled,
    Failed(ConvertError),
}

/// Streams of a running transcode.
///
/// `progress` and `errors` close when the process stops producing output;
/// `done` fires exactly once when the process exits.
pub struct EngineRun {
    pub progress: mpsc::Receiver<Progress>,
    pub errors: mpsc::Receiver<ConvertError>,
    pub done: oneshot::Receiver<EngineExit>,
}

/// An external transcoder.
///
/// `start` must return quickly; the work happens on spawned tasks. Cancelling
/// `cancel` must stop the transcode and make `done` report `Cancelled`.
pub trait TranscodeEngine: Send + Sync + 'static {
    fn start(
        &self,
        cancel: CancellationToken,
        input: &Path,
        output: &Path,
        args: &[String],
    ) -> Result<EngineRun, ConvertError>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> anyhow::Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // Distro builds append suffixes such as "-3ubuntu5" or "-static"
        let numeric: String = version_part
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let major = parts
            .next()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?
            .parse::<u32>()
            .with_context(|| format!("Failed to parse major version from: {}", version_part))?;
        let minor = parts.next().map(str::parse::<u32>).transpose()?.unwrap_or(0);
        let patch = parts.next().map(str::parse::<u32>).transpose()?.unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Transcoder backed by the ffmpeg command line tool
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
}

impl FfmpegEngine {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
        }
    }

    /// Run `ffmpeg -version` to make sure the binary is usable
    pub async fn detect_version(&self) -> anyhow::Result<FFmpegVersion> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;

        let version = FFmpegVersion::parse(first_line)?;
        info!("Using FFmpeg {}.{}.{} at {}", version.major, version.minor, version.patch, self.ffmpeg_bin.display());
        Ok(version)
    }

    pub fn build_args(input: &Path, output: &Path, args: &[String]) -> Vec<String> {
        let mut ffmpeg_args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
        ];
        ffmpeg_args.extend(args.iter().cloned());
        // Machine-readable progress on stdout, no interactive stats on stderr
        ffmpeg_args.push("-progress".to_string());
        ffmpeg_args.push("pipe:1".to_string());
        ffmpeg_args.push("-nostats".to_string());
        ffmpeg_args.push(output.display().to_string());
        ffmpeg_args
    }
}

impl TranscodeEngine for FfmpegEngine {
    fn start(
        &self,
        cancel: CancellationToken,
        input: &Path,
        output: &Path,
        args: &[String],
    ) -> Result<EngineRun, ConvertError> {
        let start_error = |source: io::Error| ConvertError::EngineStart { path: input.to_path_buf(), source };

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(start_error)?;
        }

        let ffmpeg_args = Self::build_args(input, output, args);
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), ffmpeg_args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&ffmpeg_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(start_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_error(io::Error::new(io::ErrorKind::Other, "ffmpeg stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| start_error(io::Error::new(io::ErrorKind::Other, "ffmpeg stderr not captured")))?;

        let (progress_tx, progress_rx) = mpsc::channel(32);
        let (error_tx, error_rx) = mpsc::channel(32);
        let (done_tx, done_rx) = oneshot::channel();

        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut parser = ProgressParser::new(file_name);
        let ffprobe_bin = self.ffprobe_bin.clone();
        let input_path = input.to_path_buf();

        tokio::spawn(async move {
            // Duration only feeds percent_complete, so a probe failure is not fatal
            match ffprobe::probe_file(&ffprobe_bin, &input_path).await {
                Ok(data) => {
                    debug!("Source codec for {}: {:?}", input_path.display(), data.video_codec());
                    if let Some(secs) = data.duration_secs() {
                        parser.set_duration_secs(secs);
                    }
                }
                Err(e) => {
                    let _ = error_tx
                        .send(ConvertError::EngineParse(format!("could not determine duration: {:#}", e)))
                        .await;
                }
            }
            relay_progress(stdout, parser, progress_tx, error_tx).await;
        });

        let stderr_handle = tokio::spawn(collect_tail(stderr));

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => EngineExit::Finished,
                    Ok(status) => {
                        let tail = stderr_handle.await.unwrap_or_default();
                        EngineExit::Failed(ConvertError::EngineRun(format!(
                            "ffmpeg exited with code {}: {}",
                            status.code().unwrap_or(-1),
                            tail
                        )))
                    }
                    Err(e) => EngineExit::Failed(ConvertError::EngineRun(format!(
                        "failed to wait for ffmpeg: {}",
                        e
                    ))),
                },
                _ = cancel.cancelled() => {
                    info!("FFmpeg cancelled, killing process");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill FFmpeg process: {}", e);
                    }
                    EngineExit::Cancelled
                }
            };
            let _ = done_tx.send(exit);
        });

        Ok(EngineRun { progress: progress_rx, errors: error_rx, done: done_rx })
    }
}

/// Parse ffmpeg `-progress` output until the pipe closes
async fn relay_progress<R>(
    stdout: R,
    mut parser: ProgressParser,
    progress_tx: mpsc::Sender<Progress>,
    error_tx: mpsc::Sender<ConvertError>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parser.feed_line(&line) {
                Ok(Some(progress)) => {
                    if progress_tx.send(progress).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = error_tx.send(e).await;
                }
            },
            Ok(None) => break,
            Err(e) => {
                let _ = error_tx
                    .send(ConvertError::EngineParse(format!("failed to read ffmpeg output: {}", e)))
                    .await;
                break;
            }
        }
    }
}

/// Keep the last few lines of a stream
async fn collect_tail<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        let v1 = FFmpegVersion::parse("ffmpeg version 8.0 Copyright (c) 2000-2025").unwrap();
        assert_eq!(v1, FFmpegVersion { major: 8, minor: 0, patch: 0 });

        let v2 = FFmpegVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright").unwrap();
        assert_eq!(v2, FFmpegVersion { major: 6, minor: 1, patch: 1 });

        let v3 = FFmpegVersion::parse("ffmpeg version 7.1-static https://johnvansickle.com").unwrap();
        assert_eq!(v3, FFmpegVersion { major: 7, minor: 1, patch: 0 });

        assert!(FFmpegVersion::parse("ffmpeg version n/a").is_err());
    }

    #[test]
    fn test_build_args_order() {
        let args = FfmpegEngine::build_args(
            Path::new("/in/a.mp4"),
            Path::new("/out/a.mp4"),
            &ConverterConfig::default().codec_args(),
        );
        assert_eq!(
            args,
            vec![
                "-hide_banner", "-nostdin", "-y", "-i", "/in/a.mp4",
                "-c:v", "libx264", "-c:a", "copy", "-c:s", "copy",
                "-progress", "pipe:1", "-nostats", "/out/a.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_progress_reports_blocks_and_parse_errors() {
        let output = "frame=1\nprogress=continue\nframe=oops\nframe=2\nprogress=end\n";
        let (progress_tx, mut progress_rx) = mpsc::channel(8);
        let (error_tx, mut error_rx) = mpsc::channel(8);

        relay_progress(output.as_bytes(), ProgressParser::new("a.mp4"), progress_tx, error_tx).await;

        assert_eq!(progress_rx.recv().await.unwrap().frame, 1);
        assert_eq!(progress_rx.recv().await.unwrap().frame, 2);
        assert!(progress_rx.recv().await.is_none());
        assert!(matches!(error_rx.recv().await, Some(ConvertError::EngineParse(_))));
        assert!(error_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_collect_tail_keeps_last_lines() {
        let text: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let tail = collect_tail(text.as_bytes()).await;
        let lines: Vec<_> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.first(), Some(&"line 30"));
        assert_eq!(lines.last(), Some(&"line 49"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConverterConfig {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
            ..Default::default()
        };
        let engine = FfmpegEngine::new(&config);
        let result = engine.start(
            CancellationToken::new(),
            &dir.path().join("a.mp4"),
            &dir.path().join("out").join("a.mp4"),
            &config.codec_args(),
        );
        assert!(matches!(result, Err(ConvertError::EngineStart { .. })));
    }

    #[tokio::test]
    async fn test_detect_version_missing_binary() {
        let config = ConverterConfig {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
            ..Default::default()
        };
        let err = FfmpegEngine::new(&config).detect_version().await.unwrap_err();
        assert!(err.to_string().contains("Failed to execute FFmpeg"));
    }
}
