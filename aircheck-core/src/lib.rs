pub mod browser;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod probe;
pub mod proxy;
pub mod recorder;
pub mod session;
pub mod sqlite;

pub use browser::{
    AutomationSession, BlockCategory, BlockVerdict, BrowserAutomation, BrowserError,
    BrowserLauncher, BrowserResult, CapturePage, PreparedCapture, ProfileManager, SessionLauncher,
    SessionPage, SetupController,
};
pub use cancel::CancelFlag;
pub use cleanup::{CleanupManager, CleanupReport};
pub use config::{
    load_aircheck_config, load_browser_config, load_recorder_config, AircheckConfig,
    BrowserConfig, ConfigBundle, RecorderConfig,
};
pub use error::{ConfigError, Result};
pub use orchestrator::{CaptureError, CaptureOrchestrator, CaptureResult, OrchestratorParts};
pub use probe::{ConnectivityValidator, HttpValidator, ProbeError, ProbeOutcome, ProbeResult};
pub use proxy::{
    HttpProxyProber, NewProxy, ProxyEndpoint, ProxyError, ProxyProber, ProxyRecord, ProxyResult,
    ProxyRotationService, ProxyUsageRecord, RevalidationReport, SqliteProxyStore,
    SqliteProxyStoreBuilder,
};
pub use recorder::{
    EncoderLauncher, FfmpegLauncher, PerfSample, PerfSampler, Recorder, RecorderError,
    RecorderResult, RecordingOutcome, SyntheticSampler,
};
pub use session::{
    CaptureSession, CaptureStatus, MetricSample, SessionError, SessionFault, SessionMetadata,
    SessionResult, SqliteSessionStore, SqliteSessionStoreBuilder,
};
