use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use aircheck_core::config::{EncoderSection, RecorderConfig, SamplingSection};
use aircheck_core::{
    CancelFlag, CaptureStatus, EncoderLauncher, Recorder, RecorderError, SqliteSessionStore,
};

struct ShellEncoder {
    script: &'static str,
}

#[async_trait]
impl EncoderLauncher for ShellEncoder {
    async fn spawn(&self, artifact: &Path) -> std::io::Result<Child> {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(self.script)
            .env("ARTIFACT", artifact)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

fn test_config() -> RecorderConfig {
    RecorderConfig {
        encoder: EncoderSection {
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
            display: ":99".to_string(),
            audio_source: "default".to_string(),
            frame_rate: 30,
            time_limit_seconds: 1,
            grace_seconds: 0,
            stop_wait_seconds: 1,
        },
        sampling: SamplingSection {
            poll_interval_ms: 50,
            progress_interval_seconds: 10,
        },
    }
}

// Long enough that only an explicit stop ends the run.
fn long_config() -> RecorderConfig {
    let mut config = test_config();
    config.encoder.time_limit_seconds = 30;
    config
}

fn setup(dir: &tempfile::TempDir) -> (SqliteSessionStore, String) {
    let store = SqliteSessionStore::builder()
        .path(dir.path().join("sessions.sqlite"))
        .build()
        .expect("store builds");
    store.initialize().expect("schema applies");
    let session = store.create("https://example.com/live").expect("session");
    (store, session.id)
}

fn recorder(store: &SqliteSessionStore, script: &'static str) -> Recorder {
    recorder_with(store, script, test_config())
}

fn recorder_with(store: &SqliteSessionStore, script: &'static str, config: RecorderConfig) -> Recorder {
    Recorder::new(config, store.clone()).with_launcher(Arc::new(ShellEncoder { script }))
}

#[tokio::test]
async fn clean_exit_with_output_is_a_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = recorder(&store, r#"printf video-bytes > "$ARTIFACT""#);
    let artifact = dir.path().join("out.mp4");

    let outcome = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect("recording succeeds");
    assert!(outcome.size_bytes > 0);
    assert!(outcome.warning.is_none());
    assert!(artifact.exists());

    let session = store.fetch_required(&id).expect("fetch");
    assert_eq!(session.artifact_path.as_deref(), Some(artifact.as_path()));
    assert_eq!(session.artifact_size_bytes, Some(outcome.size_bytes));
    assert!(session.metadata.observed_duration_s.is_some());
}

#[tokio::test]
async fn abnormal_exit_with_output_is_a_warning_not_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = recorder(
        &store,
        r#"printf data > "$ARTIFACT"; echo "encoder hiccup" >&2; exit 3"#,
    );
    let artifact = dir.path().join("out.mp4");

    let outcome = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect("artifact survives the bad exit");
    let warning = outcome.warning.expect("warning recorded");
    assert!(warning.contains("exited"), "got: {warning}");

    let session = store.fetch_required(&id).expect("fetch");
    assert!(session.metadata.encoder_warning.is_some());
}

#[tokio::test]
async fn stderr_diagnostics_on_clean_exit_become_a_warning() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = recorder(
        &store,
        r#"printf data > "$ARTIFACT"; echo "deprecated pixel format" >&2"#,
    );
    let artifact = dir.path().join("out.mp4");

    let outcome = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect("clean exit succeeds");
    let warning = outcome.warning.expect("diagnostics surfaced");
    assert!(warning.contains("deprecated pixel format"), "got: {warning}");

    let session = store.fetch_required(&id).expect("fetch");
    assert!(session.metadata.encoder_warning.is_some());
}

#[tokio::test]
async fn hung_encoder_is_killed_and_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    // Never writes the artifact and ignores the quit keystroke.
    let recorder = recorder(&store, "sleep 30");
    let artifact = dir.path().join("out.mp4");

    let err = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect_err("time-boxed run fails");
    assert!(matches!(err, RecorderError::TimedOut { .. }));
}

#[tokio::test]
async fn hung_encoder_fails_even_with_a_partial_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    // Leaves bytes behind but never exits; the hard cap still wins.
    let recorder = recorder(&store, r#"printf partial > "$ARTIFACT"; sleep 30"#);
    let artifact = dir.path().join("out.mp4");

    let started = Instant::now();
    let err = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect_err("a killed encoder is a failure regardless of output");
    assert!(matches!(err, RecorderError::TimedOut { .. }), "got: {err}");
    // The descendant still holds the stderr pipe open; the drain must not
    // stall the supervisor past its own bounded waits.
    assert!(
        started.elapsed() < Duration::from_secs(6),
        "record() took {:?}",
        started.elapsed()
    );

    let session = store.fetch_required(&id).expect("fetch");
    assert!(session.artifact_path.is_none(), "failed run records no artifact");
}

#[tokio::test]
async fn clean_exit_without_artifact_is_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = recorder(&store, "exit 0");
    let artifact = dir.path().join("out.mp4");

    let err = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect_err("no artifact is a failure");
    assert!(matches!(err, RecorderError::MissingArtifact(_)));
}

#[tokio::test]
async fn empty_artifact_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = recorder(&store, r#": > "$ARTIFACT""#);
    let artifact = dir.path().join("out.mp4");

    let err = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect_err("zero bytes is not a capture");
    assert!(matches!(err, RecorderError::EmptyArtifact(_)));
}

#[tokio::test]
async fn cancellation_before_output_reports_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = recorder(&store, "sleep 30");
    let artifact = dir.path().join("out.mp4");

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = recorder
        .record(&id, &artifact, &cancel)
        .await
        .expect_err("nothing recorded");
    assert!(matches!(err, RecorderError::Cancelled));
}

#[tokio::test]
async fn stop_during_recording_keeps_the_partial_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    // Writes output early, then lingers like a live encoder would.
    let recorder = recorder(&store, r#"printf partial > "$ARTIFACT"; sleep 30"#);
    let artifact = dir.path().join("out.mp4");

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        flag.cancel();
    });

    let outcome = recorder
        .record(&id, &artifact, &cancel)
        .await
        .expect("partial artifact is kept");
    assert_eq!(outcome.size_bytes, "partial".len() as i64);
}

#[tokio::test]
async fn persisted_stopping_status_ends_the_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    store
        .transition(&id, CaptureStatus::Initialized, None)
        .expect("initialized");
    store
        .transition(&id, CaptureStatus::Capturing, None)
        .expect("capturing");

    let recorder = recorder_with(
        &store,
        r#"printf partial > "$ARTIFACT"; sleep 30"#,
        long_config(),
    );
    let artifact = dir.path().join("out.mp4");

    // Another process writes the stop; no in-process cancel flag fires.
    let stopper = store.clone();
    let stop_id = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper
            .transition(&stop_id, CaptureStatus::Stopping, None)
            .expect("stopping");
    });

    let started = Instant::now();
    let outcome = recorder
        .record(&id, &artifact, &CancelFlag::new())
        .await
        .expect("stop keeps the partial artifact");
    assert_eq!(outcome.size_bytes, "partial".len() as i64);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "stop was not observed promptly: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn observed_duration_advances_while_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, id) = setup(&dir);
    let recorder = Arc::new(recorder_with(
        &store,
        r#"printf partial > "$ARTIFACT"; sleep 30"#,
        long_config(),
    ));
    let artifact = dir.path().join("out.mp4");

    let cancel = CancelFlag::new();
    let task = {
        let recorder = Arc::clone(&recorder);
        let id = id.clone();
        let artifact = artifact.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { recorder.record(&id, &artifact, &cancel).await })
    };

    // The progress interval is far off; the per-poll update must show up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let session = store.fetch_required(&id).expect("fetch mid-run");
    let mid = session
        .metadata
        .observed_duration_s
        .expect("duration visible while recording");
    assert!(mid > 0.0);

    cancel.cancel();
    let outcome = task
        .await
        .expect("worker joins")
        .expect("partial artifact kept");
    assert!(outcome.observed_duration_s >= mid);
}
