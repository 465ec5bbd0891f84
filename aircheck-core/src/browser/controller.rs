use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::cancel::CancelFlag;
use crate::proxy::ProxyEndpoint;
use crate::session::SqliteSessionStore;

use super::blockwall::{scan_page, BlockVerdict};
use super::error::{BrowserError, BrowserResult};
use super::launcher::{AutomationSession, BrowserLauncher, SessionLauncher, SessionPage};

/// Browser stack ready for recording: a live instance and the tab already
/// navigated to the source.
pub struct PreparedCapture {
    pub automation: Box<dyn AutomationSession>,
    pub page: Box<dyn SessionPage>,
}

impl std::fmt::Debug for PreparedCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCapture").finish_non_exhaustive()
    }
}

/// Drives browser setup with retries. Each attempt launches a fresh
/// browser, navigates, dwells to let dynamic challenges render, then runs
/// the block scan. Blocked attempts are torn down and retried with
/// exponential backoff; bookkeeping failures never abort the attempt.
/// Checkpoint screenshots land after navigation, on blocked scans, and
/// right before handing the page to the recorder.
#[derive(Clone)]
pub struct SetupController {
    launcher: Arc<dyn SessionLauncher>,
    store: SqliteSessionStore,
    screenshots_dir: PathBuf,
}

impl SetupController {
    pub fn new(
        launcher: BrowserLauncher,
        store: SqliteSessionStore,
        screenshots_dir: PathBuf,
    ) -> Self {
        Self::with_stack(Arc::new(launcher), store, screenshots_dir)
    }

    pub fn with_stack(
        launcher: Arc<dyn SessionLauncher>,
        store: SqliteSessionStore,
        screenshots_dir: PathBuf,
    ) -> Self {
        Self {
            launcher,
            store,
            screenshots_dir,
        }
    }

    pub fn screenshots_dir(&self) -> &Path {
        &self.screenshots_dir
    }

    pub async fn prepare(
        &self,
        session_id: &str,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        cancel: &CancelFlag,
    ) -> BrowserResult<PreparedCapture> {
        let retry = self.launcher.retry();
        let mut last_block: Option<BlockVerdict> = None;
        let mut last_error: Option<BrowserError> = None;

        for attempt in 1..=retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(BrowserError::Cancelled);
            }
            if attempt > 1 {
                let backoff = retry.base_delay_seconds * 2u64.pow(attempt as u32 - 2);
                info!(session = session_id, attempt, backoff, "backing off before retry");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }

            match self.attempt(session_id, url, proxy, cancel).await {
                Ok(prepared) => {
                    self.record_success(session_id, &prepared, attempt);
                    return Ok(prepared);
                }
                Err(AttemptFailure::Blocked(verdict)) => {
                    warn!(
                        session = session_id,
                        attempt,
                        category = %verdict.category,
                        detail = %verdict.detail,
                        "setup attempt blocked"
                    );
                    self.record_block(session_id, &verdict, attempt);
                    last_block = Some(verdict);
                }
                Err(AttemptFailure::Error(err)) => {
                    if matches!(err, BrowserError::Cancelled) {
                        return Err(err);
                    }
                    warn!(session = session_id, attempt, error = %err, "setup attempt failed");
                    self.record_error(session_id, &err);
                    last_error = Some(err);
                }
            }
        }

        if let Some(verdict) = last_block {
            return Err(BrowserError::Blocked {
                category: verdict.category,
                detail: verdict.detail,
            });
        }
        Err(last_error.unwrap_or_else(|| {
            BrowserError::Unexpected("setup retries exhausted without a cause".to_string())
        }))
    }

    async fn attempt(
        &self,
        session_id: &str,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        cancel: &CancelFlag,
    ) -> Result<PreparedCapture, AttemptFailure> {
        let mut automation = self
            .launcher
            .launch(proxy)
            .await
            .map_err(AttemptFailure::Error)?;

        let outcome = self
            .navigate_and_scan(session_id, url, automation.as_ref(), cancel)
            .await;
        match outcome {
            Ok(page) => Ok(PreparedCapture { automation, page }),
            Err(failure) => {
                if let Err(err) = automation.shutdown().await {
                    warn!(session = session_id, error = %err, "teardown after failed attempt");
                }
                Err(failure)
            }
        }
    }

    async fn navigate_and_scan(
        &self,
        session_id: &str,
        url: &str,
        automation: &dyn AutomationSession,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn SessionPage>, AttemptFailure> {
        let page = automation.open_page().await.map_err(AttemptFailure::Error)?;
        page.goto(url).await.map_err(AttemptFailure::Error)?;
        self.capture_checkpoint(session_id, page.as_ref(), "load").await;

        // Challenge walls often render client-side after load.
        let dwell = {
            let range = self.launcher.retry().dwell_seconds;
            rand::thread_rng().gen_range(range[0]..=range[1])
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(dwell)) => {}
            _ = cancel.cancelled() => {
                return Err(AttemptFailure::Error(BrowserError::Cancelled));
            }
        }

        match scan_page(page.as_ref(), &self.launcher.challenge()).await {
            Some(verdict) => {
                self.capture_checkpoint(session_id, page.as_ref(), "blocked").await;
                Err(AttemptFailure::Blocked(verdict))
            }
            None => {
                self.capture_checkpoint(session_id, page.as_ref(), "ready").await;
                Ok(page)
            }
        }
    }

    async fn capture_checkpoint(&self, session_id: &str, page: &dyn SessionPage, label: &str) {
        if let Err(err) = std::fs::create_dir_all(&self.screenshots_dir) {
            warn!(session = session_id, error = %err, "screenshot dir unavailable");
            return;
        }
        let filename = format!(
            "{session_id}-{label}-{}.png",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3f")
        );
        let path = self.screenshots_dir.join(filename);
        match page.save_screenshot(&path).await {
            Ok(()) => {
                if let Err(err) = self.store.append_screenshot(session_id, &path) {
                    warn!(session = session_id, error = %err, "failed to record screenshot");
                }
            }
            Err(err) => {
                warn!(
                    session = session_id,
                    checkpoint = label,
                    error = %err,
                    "failed to capture checkpoint screenshot"
                );
            }
        }
    }

    fn record_success(&self, session_id: &str, prepared: &PreparedCapture, attempt: usize) {
        let user_agent = prepared.automation.user_agent().to_string();
        let viewport = prepared.automation.viewport_label();
        let result = self.store.update_metadata(session_id, |meta| {
            meta.user_agent = Some(user_agent);
            meta.viewport = Some(viewport);
            meta.attempts = Some(attempt as u32);
        });
        if let Err(err) = result {
            warn!(session = session_id, error = %err, "failed to record setup metadata");
        }
    }

    fn record_block(&self, session_id: &str, verdict: &BlockVerdict, attempt: usize) {
        let message = format!(
            "setup attempt {attempt} blocked ({}): {}",
            verdict.category, verdict.detail
        );
        if let Err(err) = self.store.append_error(session_id, &message) {
            warn!(session = session_id, error = %err, "failed to record block error");
        }
        let category = verdict.category.as_str().to_string();
        let result = self
            .store
            .update_metadata(session_id, |meta| meta.block_category = Some(category));
        if let Err(err) = result {
            warn!(session = session_id, error = %err, "failed to record block category");
        }
    }

    fn record_error(&self, session_id: &str, error: &BrowserError) {
        if let Err(err) = self
            .store
            .append_error(session_id, &format!("setup error: {error}"))
        {
            warn!(session = session_id, error = %err, "failed to record setup error");
        }
    }
}

enum AttemptFailure {
    Blocked(BlockVerdict),
    Error(BrowserError),
}
