use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aircheck_core::config::{
    BrowserConfig, ChallengeSection, ChromiumSection, EncoderSection, FingerprintSection,
    FlagsSection, RecorderConfig, RetrySection, SamplingSection, UserAgentSection, ViewportSection,
};
use aircheck_core::{
    BrowserLauncher, CaptureError, CaptureOrchestrator, CaptureStatus, ConnectivityValidator,
    OrchestratorParts, ProbeOutcome, ProbeResult, ProfileManager, Recorder, SessionError,
    SetupController, SqliteSessionStore,
};

struct GatewayTimeoutValidator;

#[async_trait]
impl ConnectivityValidator for GatewayTimeoutValidator {
    async fn validate(&self, _url: &str) -> ProbeResult<ProbeOutcome> {
        Ok(ProbeOutcome::unreachable(
            Some(523),
            "source returned HTTP 523",
        ))
    }
}

/// Never answers, keeping its worker alive for concurrency tests.
struct StalledValidator;

#[async_trait]
impl ConnectivityValidator for StalledValidator {
    async fn validate(&self, _url: &str) -> ProbeResult<ProbeOutcome> {
        std::future::pending().await
    }
}

fn browser_config() -> BrowserConfig {
    BrowserConfig {
        chromium: ChromiumSection {
            executable_path: "/usr/bin/chromium".to_string(),
            headless: true,
            sandbox: false,
            disable_gpu: true,
            tab_timeout_seconds: Some(5),
        },
        flags: FlagsSection {
            no_first_run: true,
            disable_automation_controlled: true,
            disable_blink_features: vec!["AutomationControlled".to_string()],
            autoplay_policy: "no-user-gesture-required".to_string(),
            lang: Some("en-US".to_string()),
            accept_language: Some("en-US,en;q=0.9".to_string()),
        },
        user_agents: UserAgentSection {
            pool: vec!["Mozilla/5.0 test".to_string()],
        },
        viewport: ViewportSection {
            resolutions: vec![[1280, 720]],
            jitter_pixels: 0,
            device_scale_factor: [1.0, 1.0],
        },
        fingerprint: FingerprintSection {
            hide_webdriver: true,
            enable_canvas_noise: false,
            enable_webgl_mask: false,
            canvas_noise_range: [-2, 2],
            webgl_vendor: None,
            webgl_renderer: None,
        },
        retry: RetrySection {
            max_attempts: 1,
            base_delay_seconds: 0,
            dwell_seconds: [0, 0],
        },
        challenge: ChallengeSection {
            frame_selectors: Vec::new(),
            marker_selectors: Vec::new(),
        },
    }
}

fn recorder_config() -> RecorderConfig {
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

fn build_orchestrator(
    dir: &tempfile::TempDir,
    max_concurrent: u32,
) -> (Arc<CaptureOrchestrator>, SqliteSessionStore, PathBuf) {
    build_orchestrator_with(dir, max_concurrent, Arc::new(GatewayTimeoutValidator))
}

fn build_orchestrator_with(
    dir: &tempfile::TempDir,
    max_concurrent: u32,
    validator: Arc<dyn ConnectivityValidator>,
) -> (Arc<CaptureOrchestrator>, SqliteSessionStore, PathBuf) {
    let store = SqliteSessionStore::builder()
        .path(dir.path().join("sessions.sqlite"))
        .build()
        .expect("store builds");
    store.initialize().expect("schema applies");

    let profiles_dir = dir.path().join("profiles");
    let profiles =
        ProfileManager::new(&profiles_dir, Duration::from_secs(3600)).expect("profiles");
    let launcher = BrowserLauncher::new(browser_config(), profiles);
    let controller =
        SetupController::new(launcher, store.clone(), dir.path().join("screenshots"));
    let recorder = Arc::new(Recorder::new(recorder_config(), store.clone()));

    let orchestrator = CaptureOrchestrator::new(OrchestratorParts {
        store: store.clone(),
        validator,
        controller,
        recorder,
        proxies: None,
        captures_dir: dir.path().join("captures"),
        max_concurrent,
        encoder_stop_wait: Duration::from_secs(1),
    });
    (orchestrator, store, profiles_dir)
}

async fn wait_for_terminal(store: &SqliteSessionStore, id: &str) -> CaptureStatus {
    for _ in 0..100 {
        let session = store.fetch_required(id).expect("fetch");
        if session.status.is_terminal() {
            return session.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session never reached a terminal state");
}

#[tokio::test]
async fn unreachable_source_fails_fast_without_touching_the_browser() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, store, profiles_dir) = build_orchestrator(&dir, 4);

    let session = orchestrator
        .start("https://example.com/live")
        .expect("session starts");
    assert_eq!(session.status, CaptureStatus::Created);

    let status = wait_for_terminal(&store, &session.id).await;
    assert_eq!(status, CaptureStatus::Failed);

    let failed = store.fetch_required(&session.id).expect("fetch");
    assert!(
        failed.errors.iter().any(|fault| fault.message.contains("523")),
        "probe status missing from errors: {:?}",
        failed.errors
    );
    // The worker never reached browser setup, so no profile was allocated.
    let allocated = std::fs::read_dir(&profiles_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(allocated, 0);

    // Registry entry is dropped once the worker task winds down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.active_sessions(), 0);
}

#[tokio::test]
async fn concurrency_cap_rejects_new_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, _store, _profiles) = build_orchestrator(&dir, 0);

    let err = orchestrator
        .start("https://example.com/live")
        .expect_err("cap of zero admits nothing");
    assert!(matches!(err, CaptureError::ConcurrencyLimit(0)));
}

#[tokio::test]
async fn concurrency_cap_counts_live_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, _store, _profiles) =
        build_orchestrator_with(&dir, 1, Arc::new(StalledValidator));

    let first = orchestrator
        .start("https://example.com/live")
        .expect("first session admitted");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.active_sessions(), 1);

    let err = orchestrator
        .start("https://example.com/other")
        .expect_err("the cap holds while the first worker lives");
    assert!(matches!(err, CaptureError::ConcurrencyLimit(1)));
    assert_eq!(orchestrator.active_sessions(), 1);
    drop(first);
}

#[tokio::test]
async fn stop_before_capturing_is_a_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, store, _profiles) = build_orchestrator(&dir, 4);

    // A session that failed at probe time is terminal; stop must not work.
    let session = orchestrator
        .start("https://example.com/live")
        .expect("session starts");
    wait_for_terminal(&store, &session.id).await;

    let err = orchestrator.stop(&session.id).expect_err("stop rejected");
    assert!(matches!(
        err,
        CaptureError::Session(SessionError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn status_for_unknown_session_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (orchestrator, _store, _profiles) = build_orchestrator(&dir, 4);

    let err = orchestrator
        .status("no-such-session")
        .expect_err("unknown id");
    assert!(matches!(
        err,
        CaptureError::Session(SessionError::NotFound(_))
    ));
}
