use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::{
    CaptureSession, CaptureStatus, MetricSample, SessionError, SessionFault, SessionMetadata,
    SessionResult,
};

const SESSION_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SessionResult<SqliteSessionStore> {
        let path = self.path.ok_or(SessionError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSessionStore { path, flags })
    }
}

/// Durable record of every capture session. This store is the single source
/// of truth for session status; workers hold no authoritative state.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SessionResult<Self> {
        SqliteSessionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> SessionResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SessionError::Open {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| SessionError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, source_url: &str) -> SessionResult<CaptureSession> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let metadata = SessionMetadata::default();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO capture_sessions (id, source_url, status, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                source_url,
                CaptureStatus::Created.as_str(),
                created_at.naive_utc(),
                serde_json::to_string(&metadata)?,
            ],
        )?;
        Ok(CaptureSession {
            id,
            source_url: source_url.to_string(),
            status: CaptureStatus::Created,
            created_at,
            start_time: None,
            end_time: None,
            duration_s: None,
            artifact_path: None,
            artifact_size_bytes: None,
            errors: Vec::new(),
            debug_screenshots: Vec::new(),
            metadata,
        })
    }

    pub fn fetch(&self, id: &str) -> SessionResult<Option<CaptureSession>> {
        let conn = self.open()?;
        let session = conn
            .query_row(
                "SELECT id, source_url, status, created_at, start_time, end_time, duration_s,
                        artifact_path, artifact_size_bytes, metadata
                 FROM capture_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        let Some(mut session) = session else {
            return Ok(None);
        };
        session.errors = self.faults(&conn, id)?;
        session.debug_screenshots = self.screenshots(&conn, id)?;
        Ok(Some(session))
    }

    pub fn fetch_required(&self, id: &str) -> SessionResult<CaptureSession> {
        self.fetch(id)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Cheap status read for callers that poll, no history rows attached.
    pub fn status_of(&self, id: &str) -> SessionResult<CaptureStatus> {
        let conn = self.open()?;
        let status: String = conn
            .query_row(
                "SELECT status FROM capture_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        status
            .parse()
            .map_err(|_| SessionError::NotFound(id.to_string()))
    }

    /// Applies a status transition atomically with the triggering error.
    /// `start_time` is stamped on the first entry into `capturing`;
    /// `end_time` and the derived duration on entry into a terminal state.
    pub fn transition(
        &self,
        id: &str,
        to: CaptureStatus,
        error: Option<&str>,
    ) -> SessionResult<CaptureSession> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let (current, start_time): (CaptureStatus, Option<NaiveDateTime>) = tx
            .query_row(
                "SELECT status, start_time FROM capture_sessions WHERE id = ?1",
                params![id],
                |row| {
                    let status: String = row.get(0)?;
                    Ok((status, row.get::<_, Option<NaiveDateTime>>(1)?))
                },
            )
            .optional()?
            .map(|(status, start)| {
                status
                    .parse::<CaptureStatus>()
                    .map(|parsed| (parsed, start))
                    .map_err(|_| SessionError::NotFound(id.to_string()))
            })
            .transpose()?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !current.can_transition(to) {
            return Err(SessionError::InvalidTransition { from: current, to });
        }

        let now = Utc::now().naive_utc();
        if to == CaptureStatus::Capturing && start_time.is_none() {
            tx.execute(
                "UPDATE capture_sessions SET status = ?1, start_time = ?2 WHERE id = ?3",
                params![to.as_str(), now, id],
            )?;
        } else if to.is_terminal() {
            let duration = start_time
                .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
                .filter(|value| *value >= 0.0);
            tx.execute(
                "UPDATE capture_sessions SET status = ?1, end_time = ?2, duration_s = ?3
                 WHERE id = ?4",
                params![to.as_str(), now, duration, id],
            )?;
        } else {
            tx.execute(
                "UPDATE capture_sessions SET status = ?1 WHERE id = ?2",
                params![to.as_str(), id],
            )?;
        }
        if let Some(message) = error {
            tx.execute(
                "INSERT INTO capture_errors (session_id, ts, message) VALUES (?1, ?2, ?3)",
                params![id, now, message],
            )?;
        }
        tx.commit()?;
        self.fetch_required(id)
    }

    pub fn append_error(&self, id: &str, message: &str) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO capture_errors (session_id, ts, message) VALUES (?1, ?2, ?3)",
            params![id, Utc::now().naive_utc(), message],
        )?;
        Ok(())
    }

    pub fn append_screenshot(&self, id: &str, path: &Path) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO capture_screenshots (session_id, ts, path) VALUES (?1, ?2, ?3)",
            params![id, Utc::now().naive_utc(), path.to_string_lossy()],
        )?;
        Ok(())
    }

    pub fn append_metric(
        &self,
        id: &str,
        cpu_percent: Option<f64>,
        memory_percent: Option<f64>,
        frame_rate: Option<f64>,
    ) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO capture_metrics (session_id, ts, cpu_percent, memory_percent, frame_rate)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                Utc::now().naive_utc(),
                cpu_percent,
                memory_percent,
                frame_rate
            ],
        )?;
        Ok(())
    }

    /// Read-modify-write of the metadata bag inside one transaction.
    pub fn update_metadata<F>(&self, id: &str, apply: F) -> SessionResult<()>
    where
        F: FnOnce(&mut SessionMetadata),
    {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let raw: String = tx
            .query_row(
                "SELECT metadata FROM capture_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut metadata: SessionMetadata = serde_json::from_str(&raw).unwrap_or_default();
        apply(&mut metadata);
        tx.execute(
            "UPDATE capture_sessions SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_artifact(&self, id: &str, path: &Path, size_bytes: i64) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE capture_sessions SET artifact_path = ?1, artifact_size_bytes = ?2
             WHERE id = ?3",
            params![path.to_string_lossy(), size_bytes, id],
        )?;
        Ok(())
    }

    pub fn recent_metrics(&self, id: &str, limit: usize) -> SessionResult<Vec<MetricSample>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT ts, cpu_percent, memory_percent, frame_rate FROM capture_metrics
             WHERE session_id = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id, limit as i64], |row| {
            let ts: NaiveDateTime = row.get(0)?;
            Ok(MetricSample {
                timestamp: Utc.from_utc_datetime(&ts),
                cpu_percent: row.get(1)?,
                memory_percent: row.get(2)?,
                frame_rate: row.get(3)?,
            })
        })?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }

    pub fn list_recent(&self, limit: usize) -> SessionResult<Vec<CaptureSession>> {
        let ids: Vec<String> = {
            let conn = self.open()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM capture_sessions ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        let mut sessions = Vec::new();
        for id in ids {
            if let Some(session) = self.fetch(&id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn faults(&self, conn: &Connection, id: &str) -> SessionResult<Vec<SessionFault>> {
        let mut stmt = conn.prepare(
            "SELECT ts, message FROM capture_errors WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            let ts: NaiveDateTime = row.get(0)?;
            Ok(SessionFault {
                timestamp: Utc.from_utc_datetime(&ts),
                message: row.get(1)?,
            })
        })?;
        let mut faults = Vec::new();
        for row in rows {
            faults.push(row?);
        }
        Ok(faults)
    }

    fn screenshots(&self, conn: &Connection, id: &str) -> SessionResult<Vec<PathBuf>> {
        let mut stmt = conn.prepare(
            "SELECT path FROM capture_screenshots WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(PathBuf::from(row?));
        }
        Ok(paths)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<CaptureSession> {
    let created_at: NaiveDateTime = row.get("created_at")?;
    let start_time: Option<NaiveDateTime> = row.get("start_time")?;
    let end_time: Option<NaiveDateTime> = row.get("end_time")?;
    let metadata: String = row.get("metadata")?;
    let artifact_path: Option<String> = row.get("artifact_path")?;
    Ok(CaptureSession {
        id: row.get("id")?,
        source_url: row.get("source_url")?,
        status: row
            .get::<_, String>("status")?
            .parse()
            .unwrap_or(CaptureStatus::Created),
        created_at: Utc.from_utc_datetime(&created_at),
        start_time: start_time.map(|dt| Utc.from_utc_datetime(&dt)),
        end_time: end_time.map(|dt| Utc.from_utc_datetime(&dt)),
        duration_s: row.get("duration_s")?,
        artifact_path: artifact_path.map(PathBuf::from),
        artifact_size_bytes: row.get("artifact_size_bytes")?,
        errors: Vec::new(),
        debug_screenshots: Vec::new(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}
