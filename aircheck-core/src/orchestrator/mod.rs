use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::browser::{BrowserError, PreparedCapture, SessionPage, SetupController};
use crate::cancel::CancelFlag;
use crate::cleanup::CleanupManager;
use crate::probe::{ConnectivityValidator, ProbeError};
use crate::proxy::{ProxyError, ProxyRecord, ProxyRotationService};
use crate::recorder::{Recorder, RecorderError};
use crate::session::{CaptureSession, CaptureStatus, SessionError, SqliteSessionStore};

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("connectivity check failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("source unreachable{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Unreachable {
        status: Option<u16>,
        detail: String,
    },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("too many concurrent sessions (limit {0})")]
    ConcurrencyLimit(u32),
}

/// Everything one capture worker needs beyond the orchestrator itself.
pub struct OrchestratorParts {
    pub store: SqliteSessionStore,
    pub validator: Arc<dyn ConnectivityValidator>,
    pub controller: SetupController,
    pub recorder: Arc<Recorder>,
    pub proxies: Option<Arc<ProxyRotationService>>,
    pub captures_dir: PathBuf,
    pub max_concurrent: u32,
    pub encoder_stop_wait: Duration,
}

/// Owns the capture lifecycle. `start` validates nothing up front beyond
/// the concurrency cap: the spawned worker runs the probe, browser setup
/// and recording, and drives the session record through its states. The
/// store is authoritative; the in-memory registry only holds stop handles
/// for live workers.
pub struct CaptureOrchestrator {
    store: SqliteSessionStore,
    validator: Arc<dyn ConnectivityValidator>,
    controller: SetupController,
    recorder: Arc<Recorder>,
    proxies: Option<Arc<ProxyRotationService>>,
    captures_dir: PathBuf,
    max_concurrent: u32,
    encoder_stop_wait: Duration,
    registry: Mutex<HashMap<String, CancelFlag>>,
}

impl CaptureOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Arc<Self> {
        Arc::new(Self {
            store: parts.store,
            validator: parts.validator,
            controller: parts.controller,
            recorder: parts.recorder,
            proxies: parts.proxies,
            captures_dir: parts.captures_dir,
            max_concurrent: parts.max_concurrent,
            encoder_stop_wait: parts.encoder_stop_wait,
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &SqliteSessionStore {
        &self.store
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelFlag>> {
        self.registry.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn active_sessions(&self) -> usize {
        self.registry().len()
    }

    /// Creates the session record and spawns its worker. The cap check and
    /// the registry insert happen under one guard so concurrent starts
    /// cannot slip past the limit together.
    pub fn start(self: &Arc<Self>, source_url: &str) -> CaptureResult<CaptureSession> {
        let cancel = CancelFlag::new();
        let session = {
            let mut registry = self.registry();
            if registry.len() >= self.max_concurrent as usize {
                return Err(CaptureError::ConcurrencyLimit(self.max_concurrent));
            }
            let session = self.store.create(source_url)?;
            registry.insert(session.id.clone(), cancel.clone());
            session
        };
        info!(session = %session.id, url = source_url, "capture session created");

        let this = Arc::clone(self);
        let id = session.id.clone();
        let url = source_url.to_string();
        tokio::spawn(async move {
            this.run_session(&id, &url, cancel).await;
            this.registry().remove(&id);
        });
        Ok(session)
    }

    /// Requests a stop. Only a capturing session can enter `stopping`; the
    /// store rejects everything else, so stopping a finished or not-yet
    /// started session surfaces as an invalid transition.
    pub fn stop(&self, id: &str) -> CaptureResult<CaptureSession> {
        let session = self.store.transition(id, CaptureStatus::Stopping, None)?;
        match self.registry().get(id) {
            Some(cancel) => cancel.cancel(),
            None => warn!(session = id, "stop requested but no live worker found"),
        }
        Ok(session)
    }

    pub fn status(&self, id: &str) -> CaptureResult<CaptureSession> {
        Ok(self.store.fetch_required(id)?)
    }

    pub fn sessions(&self, limit: usize) -> CaptureResult<Vec<CaptureSession>> {
        Ok(self.store.list_recent(limit)?)
    }

    async fn run_session(&self, id: &str, url: &str, cancel: CancelFlag) {
        let mut cleanup = CleanupManager::new(id, self.encoder_stop_wait);
        let result = self.drive(id, url, &cancel, &mut cleanup).await;
        cleanup.run().await;
        match result {
            Ok(()) => {}
            Err(err) => {
                error!(session = id, error = %err, "capture session failed");
                self.fail_session(id, &err.to_string());
            }
        }
    }

    async fn drive(
        &self,
        id: &str,
        url: &str,
        cancel: &CancelFlag,
        cleanup: &mut CleanupManager,
    ) -> CaptureResult<()> {
        let outcome = self.validator.validate(url).await?;
        if !outcome.reachable {
            return Err(CaptureError::Unreachable {
                status: outcome.status,
                detail: outcome
                    .detail
                    .unwrap_or_else(|| "source did not answer the probe".to_string()),
            });
        }
        info!(session = id, status = ?outcome.status, "source reachable");

        let proxy = self.pick_proxy(id).await;
        self.store.transition(id, CaptureStatus::Initialized, None)?;

        let endpoint = proxy.as_ref().map(|record| record.endpoint());
        let prepared = match self
            .controller
            .prepare(id, url, endpoint.as_ref(), cancel)
            .await
        {
            Ok(prepared) => {
                self.report_proxy(id, proxy.as_ref(), true, None).await;
                prepared
            }
            Err(err) => {
                self.report_proxy(id, proxy.as_ref(), false, Some(&err.to_string()))
                    .await;
                return Err(err.into());
            }
        };
        // The browser goes straight into cleanup custody; any failure from
        // here on still tears it down.
        let PreparedCapture { automation, page } = prepared;
        if let Some(dir) = automation.scratch_dir() {
            cleanup.track_dir(dir);
        }
        cleanup.track_browser(automation);

        self.store.transition(id, CaptureStatus::Capturing, None)?;
        let artifact = self.captures_dir.join(format!("{id}.mp4"));
        let screenshots = self.spawn_progress_screenshots(id, page);
        let recording = self.recorder.record(id, &artifact, cancel).await;
        screenshots.abort();

        let outcome = recording?;
        info!(
            session = id,
            artifact = %outcome.artifact_path.display(),
            size = outcome.size_bytes,
            duration_s = outcome.observed_duration_s,
            "recording finished"
        );
        self.store.transition(id, CaptureStatus::Completed, None)?;
        Ok(())
    }

    /// Captures a screenshot of the live page at the progress cadence while
    /// the encoder runs. The task is aborted when recording ends; failures
    /// are logged and never disturb the recording itself.
    fn spawn_progress_screenshots(&self, id: &str, page: Box<dyn SessionPage>) -> JoinHandle<()> {
        let store = self.store.clone();
        let dir = self.controller.screenshots_dir().to_path_buf();
        let interval = self.recorder.progress_interval();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = std::fs::create_dir_all(&dir) {
                    warn!(session = %id, error = %err, "screenshot dir unavailable");
                    return;
                }
                let path = dir.join(format!(
                    "{id}-progress-{}.png",
                    chrono::Utc::now().format("%Y%m%dT%H%M%S")
                ));
                match page.save_screenshot(&path).await {
                    Ok(()) => {
                        if let Err(err) = store.append_screenshot(&id, &path) {
                            warn!(session = %id, error = %err, "failed to record progress screenshot");
                        }
                    }
                    Err(err) => {
                        warn!(session = %id, error = %err, "progress screenshot failed");
                    }
                }
            }
        })
    }

    async fn pick_proxy(&self, id: &str) -> Option<ProxyRecord> {
        let service = self.proxies.as_ref()?;
        match service.select_best().await {
            Ok(Some(record)) => {
                info!(session = id, proxy = %record.endpoint(), "proxy selected");
                let proxy_id = record.id;
                let result = self
                    .store
                    .update_metadata(id, move |meta| meta.proxy_id = Some(proxy_id));
                if let Err(err) = result {
                    warn!(session = id, error = %err, "failed to record proxy id");
                }
                Some(record)
            }
            Ok(None) => {
                info!(session = id, "no proxy available, connecting directly");
                None
            }
            Err(err) => {
                warn!(session = id, error = %err, "proxy selection failed, connecting directly");
                None
            }
        }
    }

    async fn report_proxy(
        &self,
        id: &str,
        proxy: Option<&ProxyRecord>,
        success: bool,
        error: Option<&str>,
    ) {
        let (Some(service), Some(record)) = (self.proxies.as_ref(), proxy) else {
            return;
        };
        if let Err(err) = service
            .record_usage(record.id, id, success, error, None)
            .await
        {
            warn!(session = id, proxy = record.id, error = %err, "failed to record proxy usage");
        }
    }

    fn fail_session(&self, id: &str, message: &str) {
        match self.store.transition(id, CaptureStatus::Failed, Some(message)) {
            Ok(_) => {}
            Err(SessionError::InvalidTransition { from, .. }) => {
                // Already terminal; keep the cause on record anyway.
                warn!(session = id, state = %from, "failure after terminal state");
                if let Err(err) = self.store.append_error(id, message) {
                    warn!(session = id, error = %err, "failed to append error");
                }
            }
            Err(err) => {
                error!(session = id, error = %err, "failed to mark session failed");
            }
        }
    }
}
