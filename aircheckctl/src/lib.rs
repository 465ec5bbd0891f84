use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use aircheck_core::{
    BrowserLauncher, CaptureOrchestrator, CaptureSession, CaptureStatus, ConfigBundle,
    HttpProxyProber, HttpValidator, MetricSample, NewProxy, OrchestratorParts, ProfileManager,
    ProxyRecord, ProxyRotationService, Recorder, RevalidationReport, SetupController,
    SqliteProxyStore, SqliteSessionStore,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] aircheck_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session error: {0}")]
    Session(#[from] aircheck_core::SessionError),
    #[error("proxy error: {0}")]
    Proxy(#[from] aircheck_core::ProxyError),
    #[error("browser error: {0}")]
    Browser(#[from] aircheck_core::BrowserError),
    #[error("capture error: {0}")]
    Capture(#[from] aircheck_core::CaptureError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid start time: {0}")]
    StartTime(String),
    #[error("authentication failed")]
    Authentication,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live capture command-line interface", long_about = None)]
pub struct Cli {
    /// Directory holding aircheck.toml, browser.toml and recorder.toml
    #[arg(long, default_value = "configs")]
    pub config_dir: PathBuf,
    /// Override for paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Token for local authentication (when AIRCHECKCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a capture and wait for it to finish
    Start(StartArgs),
    /// Show one session
    Status(StatusArgs),
    /// Request a running capture to stop
    Stop(StatusArgs),
    /// List recent sessions
    Sessions(SessionsArgs),
    /// Proxy pool management
    #[command(subcommand)]
    Proxy(ProxyCommands),
    /// Dump a session with its errors, screenshots and metric samples
    Debug(StatusArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Source URL to capture
    pub url: String,
    /// Skip proxy selection even when the pool is enabled
    #[arg(long, default_value_t = false)]
    pub no_proxy: bool,
    /// RFC 3339 time to begin at; the command waits until then
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Session identifier
    pub id: String,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    /// Maximum number of rows returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommands {
    /// Register a proxy in the pool
    Add(ProxyAddArgs),
    /// List the proxy pool with scores
    List,
    /// Probe every proxy and update its active flag
    Revalidate,
}

#[derive(Args, Debug)]
pub struct ProxyAddArgs {
    #[arg(long)]
    pub address: String,
    #[arg(long)]
    pub port: u16,
    #[arg(long, default_value = "http")]
    pub protocol: String,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Start(args) => {
            let session = context.start_capture(args)?;
            render(&SessionView::from(&session), cli.format)?;
        }
        Commands::Status(args) => {
            let session = context.session_store()?.fetch_required(&args.id)?;
            render(&SessionView::from(&session), cli.format)?;
        }
        Commands::Stop(args) => {
            let store = context.session_store()?;
            let session = store.transition(&args.id, CaptureStatus::Stopping, None)?;
            render(&SessionView::from(&session), cli.format)?;
        }
        Commands::Sessions(args) => {
            let sessions = context.session_store()?.list_recent(args.limit)?;
            let list = SessionList {
                rows: sessions.iter().map(SessionView::from).collect(),
            };
            render(&list, cli.format)?;
        }
        Commands::Proxy(ProxyCommands::Add(args)) => {
            let record = context.proxy_store()?.add(&NewProxy {
                address: args.address.clone(),
                port: args.port,
                protocol: args.protocol.clone(),
                username: args.username.clone(),
                password: args.password.clone(),
            })?;
            render(&ProxyView::from(&record), cli.format)?;
        }
        Commands::Proxy(ProxyCommands::List) => {
            let proxies = context.proxy_store()?.list()?;
            let list = ProxyList {
                rows: proxies.iter().map(ProxyView::from).collect(),
            };
            render(&list, cli.format)?;
        }
        Commands::Proxy(ProxyCommands::Revalidate) => {
            let report = context.revalidate_proxies()?;
            render(&RevalidationView { report }, cli.format)?;
        }
        Commands::Debug(args) => {
            let report = context.debug_session(&args.id)?;
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

/// How long to wait before a scheduled start. A time already in the past
/// starts immediately rather than erroring.
fn start_delay(at: &str, now: chrono::DateTime<chrono::Utc>) -> Result<Duration> {
    let target = chrono::DateTime::parse_from_rfc3339(at)
        .map_err(|err| AppError::StartTime(format!("{at}: {err}")))?
        .with_timezone(&chrono::Utc);
    Ok((target - now).to_std().unwrap_or(Duration::ZERO))
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("AIRCHECKCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    bundle: ConfigBundle,
    data_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let bundle = ConfigBundle::from_directory(&cli.config_dir)?;
        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&bundle.aircheck.paths.data_dir));
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { bundle, data_dir })
    }

    fn sessions_db(&self) -> PathBuf {
        self.data_dir.join("sessions.sqlite")
    }

    fn proxies_db(&self) -> PathBuf {
        self.data_dir.join("proxies.sqlite")
    }

    fn session_store(&self) -> Result<SqliteSessionStore> {
        let store = SqliteSessionStore::builder()
            .path(self.sessions_db())
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn proxy_store(&self) -> Result<SqliteProxyStore> {
        let store = SqliteProxyStore::builder()
            .path(self.proxies_db())
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn proxy_service(&self) -> Result<ProxyRotationService> {
        let store = self.proxy_store()?;
        let prober = Arc::new(HttpProxyProber::new(&self.bundle.aircheck.proxy));
        Ok(ProxyRotationService::new(
            store,
            prober,
            Duration::from_secs(self.bundle.aircheck.proxy.cooldown_seconds),
        ))
    }

    fn runtime(&self) -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    fn start_capture(&self, args: &StartArgs) -> Result<CaptureSession> {
        let store = self.session_store()?;
        let profiles_dir = PathBuf::from(&self.bundle.aircheck.paths.profiles_dir);
        let ttl = Duration::from_secs(self.bundle.aircheck.limits.profile_ttl_hours * 3600);
        let profiles = ProfileManager::new(&profiles_dir, ttl)?;
        let launcher = BrowserLauncher::new(self.bundle.browser.clone(), profiles);
        let controller =
            SetupController::new(launcher, store.clone(), self.data_dir.join("screenshots"));
        let recorder = Arc::new(Recorder::new(self.bundle.recorder.clone(), store.clone()));
        let proxies = if self.bundle.aircheck.proxy.enabled && !args.no_proxy {
            Some(Arc::new(self.proxy_service()?))
        } else {
            None
        };
        let captures_dir = PathBuf::from(&self.bundle.aircheck.paths.captures_dir);

        let orchestrator = CaptureOrchestrator::new(OrchestratorParts {
            store,
            validator: Arc::new(HttpValidator::new(&self.bundle.aircheck.probe)),
            controller,
            recorder,
            proxies,
            captures_dir,
            max_concurrent: self.bundle.aircheck.limits.max_concurrent_sessions,
            encoder_stop_wait: Duration::from_secs(self.bundle.recorder.encoder.stop_wait_seconds),
        });

        let wait = match args.at.as_deref() {
            Some(at) => start_delay(at, chrono::Utc::now())?,
            None => Duration::ZERO,
        };

        let runtime = self.runtime()?;
        let url = args.url.clone();
        let session = runtime.block_on(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            let session = orchestrator.start(&url)?;
            let id = session.id.clone();
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let current = orchestrator.status(&id)?;
                if current.status.is_terminal() {
                    return Ok::<_, AppError>(current);
                }
            }
        })?;
        Ok(session)
    }

    fn revalidate_proxies(&self) -> Result<RevalidationReport> {
        let service = self.proxy_service()?;
        let runtime = self.runtime()?;
        Ok(runtime.block_on(async move { service.revalidate_pool().await })?)
    }

    fn debug_session(&self, id: &str) -> Result<DebugReport> {
        let store = self.session_store()?;
        let session = store.fetch_required(id)?;
        let metrics = store.recent_metrics(id, 30)?;
        Ok(DebugReport {
            session: SessionView::from(&session),
            errors: session
                .errors
                .iter()
                .map(|fault| format!("{} {}", fault.timestamp.to_rfc3339(), fault.message))
                .collect(),
            screenshots: session
                .debug_screenshots
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            metrics,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub source_url: String,
    pub status: CaptureStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size_bytes: Option<i64>,
    pub error_count: usize,
}

impl From<&CaptureSession> for SessionView {
    fn from(session: &CaptureSession) -> Self {
        Self {
            id: session.id.clone(),
            source_url: session.source_url.clone(),
            status: session.status,
            created_at: session.created_at.to_rfc3339(),
            duration_s: session.duration_s,
            artifact_path: session
                .artifact_path
                .as_ref()
                .map(|path| path.display().to_string()),
            artifact_size_bytes: session.artifact_size_bytes,
            error_count: session.errors.len(),
        }
    }
}

impl DisplayFallback for SessionView {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Session: {}", self.id),
            format!("  url:     {}", self.source_url),
            format!("  status:  {}", self.status),
            format!("  created: {}", self.created_at),
        ];
        if let Some(duration) = self.duration_s {
            lines.push(format!("  length:  {duration:.1}s"));
        }
        if let Some(path) = &self.artifact_path {
            let size = self.artifact_size_bytes.unwrap_or(0);
            lines.push(format!("  artifact: {path} ({size} bytes)"));
        }
        if self.error_count > 0 {
            lines.push(format!("  errors:  {}", self.error_count));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<SessionView>,
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no sessions recorded".to_string();
        }
        self.rows
            .iter()
            .map(|row| format!("{}  {:<11}  {}", row.id, row.status, row.source_url))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProxyView {
    pub id: i64,
    pub endpoint: String,
    pub is_active: bool,
    pub score: f64,
    pub success_count: i64,
    pub fail_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&ProxyRecord> for ProxyView {
    fn from(record: &ProxyRecord) -> Self {
        Self {
            id: record.id,
            endpoint: record.endpoint().server_arg(),
            is_active: record.is_active,
            score: record.score(),
            success_count: record.success_count,
            fail_count: record.fail_count,
            last_error: record.last_error.clone(),
        }
    }
}

impl DisplayFallback for ProxyView {
    fn display(&self) -> String {
        format!(
            "#{} {} active={} score={:.2} ({}+ / {}-)",
            self.id, self.endpoint, self.is_active, self.score, self.success_count, self.fail_count
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ProxyList {
    pub rows: Vec<ProxyView>,
}

impl DisplayFallback for ProxyList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "proxy pool is empty".to_string();
        }
        self.rows
            .iter()
            .map(|row| row.display())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RevalidationView {
    pub report: RevalidationReport,
}

impl DisplayFallback for RevalidationView {
    fn display(&self) -> String {
        format!(
            "checked {} proxies: {} active, {} disabled",
            self.report.checked, self.report.active, self.report.disabled
        )
    }
}

#[derive(Debug, Serialize)]
pub struct DebugReport {
    pub session: SessionView,
    pub errors: Vec<String>,
    pub screenshots: Vec<String>,
    pub metrics: Vec<MetricSample>,
}

impl DisplayFallback for DebugReport {
    fn display(&self) -> String {
        let mut lines = vec![self.session.display()];
        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for error in &self.errors {
                lines.push(format!("  - {error}"));
            }
        }
        if !self.screenshots.is_empty() {
            lines.push("Screenshots:".to_string());
            for path in &self.screenshots {
                lines.push(format!("  - {path}"));
            }
        }
        if !self.metrics.is_empty() {
            lines.push("Metric samples:".to_string());
            for sample in &self.metrics {
                lines.push(format!(
                    "  - {} cpu={:?} mem={:?} fps={:?}",
                    sample.timestamp.to_rfc3339(),
                    sample.cpu_percent,
                    sample.memory_percent,
                    sample.frame_rate
                ));
            }
        }
        lines.join("\n")
    }
}
