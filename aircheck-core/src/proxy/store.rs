use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::sqlite::configure_connection;

use super::{ProxyError, ProxyRecord, ProxyResult, ProxyUsageRecord};

const PROXY_SCHEMA: &str = include_str!("../../../sql/proxies.sql");

#[derive(Debug, Clone)]
pub struct NewProxy {
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SqliteProxyStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteProxyStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteProxyStoreBuilder {
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

    pub fn build(self) -> ProxyResult<SqliteProxyStore> {
        let path = self.path.ok_or(ProxyError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteProxyStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteProxyStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteProxyStore {
    pub fn builder() -> SqliteProxyStoreBuilder {
        SqliteProxyStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> ProxyResult<Self> {
        SqliteProxyStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> ProxyResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            ProxyError::Open {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| ProxyError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> ProxyResult<()> {
        let conn = self.open()?;
        conn.execute_batch(PROXY_SCHEMA)?;
        Ok(())
    }

    pub fn add(&self, proxy: &NewProxy) -> ProxyResult<ProxyRecord> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO proxies (address, port, protocol, username, password)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                proxy.address,
                proxy.port,
                proxy.protocol,
                proxy.username,
                proxy.password
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.get_with(&conn, id)?.ok_or(ProxyError::NotFound(id))
    }

    pub fn get(&self, id: i64) -> ProxyResult<Option<ProxyRecord>> {
        let conn = self.open()?;
        self.get_with(&conn, id)
    }

    pub fn list(&self) -> ProxyResult<Vec<ProxyRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], proxy_from_row)?;
        let mut proxies = Vec::new();
        for row in rows {
            proxies.push(row?);
        }
        Ok(proxies)
    }

    /// Best active proxy outside the cooldown window, by smoothed success
    /// rate. Never-used proxies are eligible immediately. The winner's
    /// `last_used_at` is stamped in the same transaction so a second call
    /// inside the cooldown cannot return the same proxy.
    pub fn select_best(&self, cooldown: Duration) -> ProxyResult<Option<ProxyRecord>> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let threshold =
            (Utc::now() - chrono::Duration::seconds(cooldown.as_secs() as i64)).naive_utc();
        let selected = tx
            .query_row(
                &format!(
                    "SELECT {PROXY_COLUMNS} FROM proxies
                     WHERE is_active = 1
                       AND (last_used_at IS NULL OR last_used_at <= ?1)
                     ORDER BY CAST(success_count AS REAL)
                              / (success_count + fail_count + 1) DESC,
                              last_used_at ASC,
                              id ASC
                     LIMIT 1"
                ),
                params![threshold],
                proxy_from_row,
            )
            .optional()?;
        let Some(mut proxy) = selected else {
            tx.commit()?;
            return Ok(None);
        };
        let now = Utc::now();
        tx.execute(
            "UPDATE proxies SET last_used_at = ?1 WHERE id = ?2",
            params![now.naive_utc(), proxy.id],
        )?;
        tx.commit()?;
        proxy.last_used_at = Some(now);
        Ok(Some(proxy))
    }

    /// Bumps the success or failure counter and appends the usage row in
    /// one transaction.
    pub fn record_usage(
        &self,
        proxy_id: i64,
        capture_id: &str,
        success: bool,
        error: Option<&str>,
        response_time_ms: Option<i64>,
    ) -> ProxyResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();
        let column = if success {
            "success_count"
        } else {
            "fail_count"
        };
        let updated = tx.execute(
            &format!(
                "UPDATE proxies SET {column} = {column} + 1, last_used_at = ?1 WHERE id = ?2"
            ),
            params![now, proxy_id],
        )?;
        if updated == 0 {
            return Err(ProxyError::NotFound(proxy_id));
        }
        tx.execute(
            "INSERT INTO proxy_usages (proxy_id, capture_id, used_at, success, error, response_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![proxy_id, capture_id, now, success, error, response_time_ms],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn mark_checked(&self, id: i64, active: bool, error: Option<&str>) -> ProxyResult<()> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE proxies SET is_active = ?1, last_checked_at = ?2, last_error = ?3
             WHERE id = ?4",
            params![active, Utc::now().naive_utc(), error, id],
        )?;
        if updated == 0 {
            return Err(ProxyError::NotFound(id));
        }
        Ok(())
    }

    pub fn usages(&self, proxy_id: i64, limit: usize) -> ProxyResult<Vec<ProxyUsageRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT proxy_id, capture_id, used_at, success, error, response_time_ms
             FROM proxy_usages WHERE proxy_id = ?1 ORDER BY used_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![proxy_id, limit as i64], |row| {
            let used_at: NaiveDateTime = row.get(2)?;
            Ok(ProxyUsageRecord {
                proxy_id: row.get(0)?,
                capture_id: row.get(1)?,
                used_at: Utc.from_utc_datetime(&used_at),
                success: row.get(3)?,
                error: row.get(4)?,
                response_time_ms: row.get(5)?,
            })
        })?;
        let mut usages = Vec::new();
        for row in rows {
            usages.push(row?);
        }
        Ok(usages)
    }

    fn get_with(&self, conn: &Connection, id: i64) -> ProxyResult<Option<ProxyRecord>> {
        let proxy = conn
            .query_row(
                &format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE id = ?1"),
                params![id],
                proxy_from_row,
            )
            .optional()?;
        Ok(proxy)
    }
}

const PROXY_COLUMNS: &str = "id, address, port, protocol, username, password, success_count, \
                             fail_count, last_used_at, is_active, last_checked_at, last_error";

fn proxy_from_row(row: &Row<'_>) -> rusqlite::Result<ProxyRecord> {
    let last_used_at: Option<NaiveDateTime> = row.get(8)?;
    let last_checked_at: Option<NaiveDateTime> = row.get(10)?;
    Ok(ProxyRecord {
        id: row.get(0)?,
        address: row.get(1)?,
        port: row.get(2)?,
        protocol: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
        success_count: row.get(6)?,
        fail_count: row.get(7)?,
        last_used_at: last_used_at.map(|dt| Utc.from_utc_datetime(&dt)),
        is_active: row.get(9)?,
        last_checked_at: last_checked_at.map(|dt| Utc.from_utc_datetime(&dt)),
        last_error: row.get(11)?,
    })
}
