use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::config::RecorderConfig;
use crate::session::{CaptureStatus, SessionError, SqliteSessionStore};

pub type RecorderResult<T> = Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoder ran past its time limit and was killed: {detail}")]
    TimedOut { detail: String },
    #[error("encoder produced no artifact at {0}")]
    MissingArtifact(PathBuf),
    #[error("encoder produced an empty artifact at {0}")]
    EmptyArtifact(PathBuf),
    #[error("session bookkeeping failed: {0}")]
    Session(#[from] SessionError),
    #[error("recording cancelled before any output was produced")]
    Cancelled,
}

/// Spawns the encoder process for one recording. The child must have stdin
/// and stderr piped: stdin carries the graceful stop keystroke, stderr is
/// drained for diagnostics.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn spawn(&self, artifact: &Path) -> std::io::Result<Child>;
}

/// Screen-grab ffmpeg invocation against the virtual display.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    config: RecorderConfig,
}

impl FfmpegLauncher {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    fn args(&self, artifact: &Path) -> Vec<String> {
        let encoder = &self.config.encoder;
        vec![
            "-y".into(),
            "-f".into(),
            "x11grab".into(),
            "-framerate".into(),
            encoder.frame_rate.to_string(),
            "-i".into(),
            encoder.display.clone(),
            "-f".into(),
            "pulse".into(),
            "-i".into(),
            encoder.audio_source.clone(),
            // Encoder-side ceiling; the supervisor enforces its own.
            "-t".into(),
            encoder.time_limit_seconds.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-c:a".into(),
            "aac".into(),
            artifact.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn spawn(&self, artifact: &Path) -> std::io::Result<Child> {
        Command::new(&self.config.encoder.ffmpeg_path)
            .args(self.args(artifact))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Periodic runtime readings attached to a recording. The synthetic default
/// stands in where no real process accounting is wired up.
pub trait PerfSampler: Send + Sync {
    fn sample(&self) -> PerfSample;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub frame_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticSampler {
    frame_rate: f64,
}

impl SyntheticSampler {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate as f64,
        }
    }
}

impl PerfSampler for SyntheticSampler {
    fn sample(&self) -> PerfSample {
        let mut rng = rand::thread_rng();
        PerfSample {
            cpu_percent: rng.gen_range(20.0..60.0),
            memory_percent: rng.gen_range(30.0..50.0),
            frame_rate: self.frame_rate + rng.gen_range(-2.0..0.5),
        }
    }
}

/// Result of a finished recording. A warning means the encoder exited
/// abnormally but still left a usable artifact behind, or exited cleanly
/// while complaining on stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingOutcome {
    pub artifact_path: PathBuf,
    pub size_bytes: i64,
    pub observed_duration_s: f64,
    pub warning: Option<String>,
}

/// Supervises one encoder run: time-boxes it, samples progress into the
/// session store, and guarantees either a non-empty artifact or an error.
/// An encoder that has to be killed at the hard cap is a failure no matter
/// what it left on disk. The poll loop honors both the in-process cancel
/// flag and a `stopping` status persisted by another process.
pub struct Recorder {
    config: RecorderConfig,
    store: SqliteSessionStore,
    launcher: Arc<dyn EncoderLauncher>,
    sampler: Arc<dyn PerfSampler>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, store: SqliteSessionStore) -> Self {
        let launcher = Arc::new(FfmpegLauncher::new(config.clone()));
        let sampler = Arc::new(SyntheticSampler::new(config.encoder.frame_rate));
        Self {
            config,
            store,
            launcher,
            sampler,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn EncoderLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn PerfSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.config.sampling.progress_interval_seconds)
    }

    pub async fn record(
        &self,
        session_id: &str,
        artifact_path: &Path,
        cancel: &CancelFlag,
    ) -> RecorderResult<RecordingOutcome> {
        if let Some(parent) = artifact_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut child = self
            .launcher
            .spawn(artifact_path)
            .await
            .map_err(RecorderError::Spawn)?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                // Keep only the tail; ffmpeg logs every frame.
                if buf.len() > 4096 {
                    buf.drain(..buf.len() - 4096);
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let poll_interval = Duration::from_millis(self.config.sampling.poll_interval_ms);
        let progress_interval =
            Duration::from_secs(self.config.sampling.progress_interval_seconds);
        let hard_limit = Duration::from_secs(
            self.config.encoder.time_limit_seconds + self.config.encoder.grace_seconds,
        );
        let started = Instant::now();
        let mut last_progress = started;
        let mut timed_out = false;
        let mut stopped = false;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if cancel.is_cancelled() || self.stop_requested(session_id) {
                info!(session = session_id, "stop requested, ending recording");
                stopped = true;
                self.stop_encoder(&mut child, session_id).await?;
                break None;
            }
            if started.elapsed() >= hard_limit {
                warn!(
                    session = session_id,
                    limit_s = self.config.encoder.time_limit_seconds,
                    "encoder exceeded time limit plus grace"
                );
                timed_out = true;
                self.stop_encoder(&mut child, session_id).await?;
                break None;
            }
            if last_progress.elapsed() >= progress_interval {
                last_progress = Instant::now();
                self.record_progress(session_id);
            }
            self.record_observed(session_id, started.elapsed());
            sleep(poll_interval).await;
        };

        let observed = started.elapsed().as_secs_f64();
        // The drain task can outlive the encoder when a descendant keeps the
        // pipe open, so the join is bounded like everything else here.
        let drain_wait = Duration::from_secs(self.config.encoder.stop_wait_seconds);
        let stderr_tail = match stderr_task {
            Some(mut task) => match timeout(drain_wait, &mut task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    debug!(session = session_id, "stderr still held open, abandoning drain");
                    task.abort();
                    String::new()
                }
            },
            None => String::new(),
        };

        if timed_out {
            let detail = if stderr_tail.trim().is_empty() {
                "no encoder diagnostics".to_string()
            } else {
                tail_lines(&stderr_tail)
            };
            return Err(RecorderError::TimedOut { detail });
        }

        let mut warning = None;
        if let Some(status) = status {
            if !status.success() && !stopped {
                warning = Some(format!(
                    "encoder exited with {status}: {}",
                    tail_lines(&stderr_tail)
                ));
            } else if status.success() && !stderr_tail.trim().is_empty() {
                warning = Some(format!(
                    "encoder diagnostics: {}",
                    tail_lines(&stderr_tail)
                ));
            }
        }

        let size = match tokio::fs::metadata(artifact_path).await {
            Ok(metadata) => metadata.len() as i64,
            Err(_) if stopped => return Err(RecorderError::Cancelled),
            Err(_) => return Err(RecorderError::MissingArtifact(artifact_path.to_path_buf())),
        };
        if size == 0 {
            return Err(RecorderError::EmptyArtifact(artifact_path.to_path_buf()));
        }

        self.store.set_artifact(session_id, artifact_path, size)?;
        let warning_for_meta = warning.clone();
        self.store.update_metadata(session_id, move |meta| {
            meta.observed_duration_s = Some(observed);
            if warning_for_meta.is_some() {
                meta.encoder_warning = warning_for_meta;
            }
        })?;
        if let Some(message) = &warning {
            warn!(session = session_id, warning = %message, "recording finished with warning");
        }

        Ok(RecordingOutcome {
            artifact_path: artifact_path.to_path_buf(),
            size_bytes: size,
            observed_duration_s: observed,
            warning,
        })
    }

    /// Graceful stop: the quit keystroke first so the encoder can finalize
    /// the container, a bounded wait, then a hard kill.
    async fn stop_encoder(&self, child: &mut Child, session_id: &str) -> RecorderResult<()> {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(b"q").await {
                debug!(session = session_id, error = %err, "encoder stdin already closed");
            }
            let _ = stdin.shutdown().await;
        }
        let wait = Duration::from_secs(self.config.encoder.stop_wait_seconds);
        match timeout(wait, child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(session = session_id, "encoder ignored graceful stop, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    /// A `stopping` status written by another process counts as a stop
    /// request, same as the in-process cancel flag.
    fn stop_requested(&self, session_id: &str) -> bool {
        matches!(
            self.store.status_of(session_id),
            Ok(CaptureStatus::Stopping)
        )
    }

    fn record_progress(&self, session_id: &str) {
        let sample = self.sampler.sample();
        if let Err(err) = self.store.append_metric(
            session_id,
            Some(sample.cpu_percent),
            Some(sample.memory_percent),
            Some(sample.frame_rate),
        ) {
            warn!(session = session_id, error = %err, "failed to append metric sample");
        }
    }

    /// The observed duration advances on every poll pass so a reader always
    /// sees a fresh figure, not one that is up to a progress interval stale.
    fn record_observed(&self, session_id: &str, elapsed: Duration) {
        let observed = elapsed.as_secs_f64();
        let result = self
            .store
            .update_metadata(session_id, move |meta| {
                meta.observed_duration_s = Some(observed)
            });
        if let Err(err) = result {
            warn!(session = session_id, error = %err, "failed to update observed duration");
        }
    }
}

fn tail_lines(tail: &str) -> String {
    let mut lines = tail.lines().rev().take(3).collect::<Vec<_>>();
    lines.reverse();
    lines.join(" | ")
}
