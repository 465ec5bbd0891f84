mod store;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{SqliteSessionStore, SqliteSessionStoreBuilder};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("session database error: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("session store path not configured")]
    MissingStore,
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: CaptureStatus,
        to: CaptureStatus,
    },
    #[error("metadata serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle of one capture attempt. Transitions only move forward;
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Created,
    Initialized,
    Capturing,
    Stopping,
    Completed,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Created => "created",
            CaptureStatus::Initialized => "initialized",
            CaptureStatus::Capturing => "capturing",
            CaptureStatus::Stopping => "stopping",
            CaptureStatus::Completed => "completed",
            CaptureStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureStatus::Completed | CaptureStatus::Failed)
    }

    /// Forward-only transition table. `failed` is reachable from any
    /// non-terminal state; `completed` only once capture has started.
    pub fn can_transition(&self, next: CaptureStatus) -> bool {
        use CaptureStatus::*;
        match (self, next) {
            (Created, Initialized) => true,
            (Initialized, Capturing) => true,
            (Capturing, Stopping) => true,
            (Capturing, Completed) | (Stopping, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(CaptureStatus::Created),
            "initialized" => Ok(CaptureStatus::Initialized),
            "capturing" => Ok(CaptureStatus::Capturing),
            "stopping" => Ok(CaptureStatus::Stopping),
            "completed" => Ok(CaptureStatus::Completed),
            "failed" => Ok(CaptureStatus::Failed),
            other => Err(format!("unknown capture status: {other}")),
        }
    }
}

/// One appended error entry. Rows are append-only and never cleared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFault {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Stage markers written by the orchestration components. Fixed fields for
/// the values every session records, plus an open map for anything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder_warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CaptureSession {
    pub id: String,
    pub source_url: String,
    pub status: CaptureStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub artifact_path: Option<PathBuf>,
    pub artifact_size_bytes: Option<i64>,
    pub errors: Vec<SessionFault>,
    pub debug_screenshots: Vec<PathBuf>,
    pub metadata: SessionMetadata,
}

/// One progress sample written by the recorder poll loop.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub frame_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_allowed() {
        use CaptureStatus::*;
        assert!(Created.can_transition(Initialized));
        assert!(Initialized.can_transition(Capturing));
        assert!(Capturing.can_transition(Stopping));
        assert!(Capturing.can_transition(Completed));
        assert!(Stopping.can_transition(Completed));
        assert!(Stopping.can_transition(Failed));
        assert!(Created.can_transition(Failed));
    }

    #[test]
    fn regressions_and_terminal_exits_rejected() {
        use CaptureStatus::*;
        assert!(!Capturing.can_transition(Initialized));
        assert!(!Initialized.can_transition(Created));
        assert!(!Completed.can_transition(Failed));
        assert!(!Failed.can_transition(Capturing));
        assert!(!Completed.can_transition(Stopping));
        assert!(!Created.can_transition(Capturing));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            CaptureStatus::Created,
            CaptureStatus::Initialized,
            CaptureStatus::Capturing,
            CaptureStatus::Stopping,
            CaptureStatus::Completed,
            CaptureStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CaptureStatus>().unwrap(), status);
        }
    }
}
