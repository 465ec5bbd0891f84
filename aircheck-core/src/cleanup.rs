use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::browser::AutomationSession;

/// What a cleanup pass actually did. `issues` collects failures that were
/// swallowed so the caller can log them without aborting teardown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub browser_closed: bool,
    pub encoder_stopped: bool,
    pub dirs_removed: usize,
    pub issues: Vec<String>,
}

/// Tears down everything a capture session allocated. Resources are handed
/// over as they are created; `run` releases whatever it holds and drains
/// its lists, so calling it again is a no-op.
pub struct CleanupManager {
    session_id: String,
    automation: Option<Box<dyn AutomationSession>>,
    encoder: Option<Child>,
    dirs: Vec<PathBuf>,
    encoder_stop_wait: Duration,
}

impl CleanupManager {
    pub fn new(session_id: impl Into<String>, encoder_stop_wait: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            automation: None,
            encoder: None,
            dirs: Vec::new(),
            encoder_stop_wait,
        }
    }

    pub fn track_browser(&mut self, automation: Box<dyn AutomationSession>) {
        self.automation = Some(automation);
    }

    pub fn track_encoder(&mut self, child: Child) {
        self.encoder = Some(child);
    }

    pub fn track_dir(&mut self, dir: PathBuf) {
        self.dirs.push(dir);
    }

    pub async fn run(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(mut child) = self.encoder.take() {
            match self.stop_child(&mut child).await {
                Ok(()) => report.encoder_stopped = true,
                Err(err) => report.issues.push(format!("encoder teardown: {err}")),
            }
        }

        if let Some(mut automation) = self.automation.take() {
            match automation.shutdown().await {
                Ok(()) => report.browser_closed = true,
                Err(err) => report.issues.push(format!("browser teardown: {err}")),
            }
        }

        for dir in self.dirs.drain(..) {
            if !dir.exists() {
                continue;
            }
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => report.dirs_removed += 1,
                Err(err) => report
                    .issues
                    .push(format!("removing {}: {err}", dir.display())),
            }
        }

        if report.issues.is_empty() {
            info!(
                session = %self.session_id,
                browser = report.browser_closed,
                encoder = report.encoder_stopped,
                dirs = report.dirs_removed,
                "cleanup finished"
            );
        } else {
            for issue in &report.issues {
                warn!(session = %self.session_id, issue = %issue, "cleanup issue");
            }
        }
        report
    }

    async fn stop_child(&self, child: &mut Child) -> std::io::Result<()> {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }
        match timeout(self.encoder_stop_wait, child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(session = %self.session_id, "encoder ignored stop, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_is_idempotent_over_directories() {
        let base = tempfile::tempdir().expect("tempdir");
        let target = base.path().join("session-scratch");
        std::fs::create_dir_all(&target).expect("scratch dir");

        let mut cleanup = CleanupManager::new("session-1", Duration::from_secs(1));
        cleanup.track_dir(target.clone());

        let first = cleanup.run().await;
        assert_eq!(first.dirs_removed, 1);
        assert!(first.issues.is_empty());
        assert!(!target.exists());

        let second = cleanup.run().await;
        assert_eq!(second.dirs_removed, 0);
        assert!(second.issues.is_empty());
    }

    #[tokio::test]
    async fn missing_directories_are_skipped_silently() {
        let base = tempfile::tempdir().expect("tempdir");
        let mut cleanup = CleanupManager::new("session-2", Duration::from_secs(1));
        cleanup.track_dir(base.path().join("never-created"));
        let report = cleanup.run().await;
        assert_eq!(report.dirs_removed, 0);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn stops_a_live_encoder_process() {
        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .stdin(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleeper");
        // sh ignores the quit keystroke, so this exercises the kill path.
        let mut cleanup = CleanupManager::new("session-3", Duration::from_millis(200));
        cleanup.track_encoder(child);
        let report = cleanup.run().await;
        assert!(report.encoder_stopped);
        assert!(report.issues.is_empty());
    }
}
