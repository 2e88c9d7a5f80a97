use crate::app::tasks::PeriodicTask;
use crate::domain::audit::{AuditFilter, AuditRecord};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_AUDIT_RETENTION: Duration = Duration::from_secs(90 * 24 * 3600);
pub const DEFAULT_AUDIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    request_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    remote_addr TEXT NOT NULL,
    session_id TEXT,
    approval_id TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_records(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_records(user_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_records(session_id, timestamp);
";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("audit record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("audit queries require the database index")]
    NoDatabase,
    #[error("audit store is closed")]
    Closed,
}

/// Append-only JSONL audit trail with an optional SQLite index for queries.
pub struct AuditStore {
    path: PathBuf,
    jsonl: Mutex<Option<File>>,
    db: Option<Mutex<Option<Connection>>>,
    retention: Duration,
    cleanup: Mutex<Option<Arc<PeriodicTask>>>,
}

impl AuditStore {
    pub fn open(
        jsonl_path: &Path,
        db: Option<Connection>,
        retention: Duration,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = jsonl_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(jsonl_path)
            .with_context(|| format!("opening audit log {}", jsonl_path.display()))?;
        let db = match db {
            Some(conn) => {
                conn.execute_batch(SCHEMA).context("creating audit schema")?;
                Some(Mutex::new(Some(conn)))
            }
            None => None,
        };
        Ok(Self {
            path: jsonl_path.to_path_buf(),
            jsonl: Mutex::new(Some(file)),
            db,
            retention: if retention.is_zero() {
                DEFAULT_AUDIT_RETENTION
            } else {
                retention
            },
            cleanup: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_index(&self) -> bool {
        self.db.is_some()
    }

    /// Appends the JSONL line, then indexes the row. Only a failed JSONL
    /// write is reported to the caller.
    pub fn record(&self, mut record: AuditRecord) -> Result<AuditRecord, AuditError> {
        let timestamp = *record.timestamp.get_or_insert_with(Utc::now);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        {
            let mut guard = self.jsonl.lock().unwrap_or_else(PoisonError::into_inner);
            let file = guard.as_mut().ok_or(AuditError::Closed)?;
            file.write_all(&line)?;
            file.flush()?;
        }

        if let Some(db) = &self.db {
            let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(conn) = guard.as_ref() {
                if let Err(err) = insert_row(conn, &record, timestamp) {
                    warn!(%err, request_id = %record.request_id, "failed to index audit record");
                }
            }
        }
        Ok(record)
    }

    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        use rusqlite::types::Value as SqlValue;

        let db = self.db.as_ref().ok_or(AuditError::NoDatabase)?;
        let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(AuditError::Closed)?;

        let mut sql = String::from(
            "SELECT timestamp, request_id, user_id, role, action, resource, method, path, status_code,
                    duration_ms, remote_addr, session_id, approval_id, error
             FROM audit_records WHERE 1=1",
        );
        let mut values: Vec<SqlValue> = Vec::new();
        let text_filters = [
            ("user_id", &filter.user_id),
            ("role", &filter.role),
            ("action", &filter.action),
            ("resource", &filter.resource),
            ("session_id", &filter.session_id),
            ("approval_id", &filter.approval_id),
        ];
        for (column, value) in text_filters {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                sql.push_str(&format!(" AND {column} = ?"));
                values.push(SqlValue::Text(value.clone()));
            }
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            values.push(SqlValue::Integer(since.timestamp_millis()));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp <= ?");
            values.push(SqlValue::Integer(until.timestamp_millis()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(filter.effective_limit() as i64));
        values.push(SqlValue::Integer(filter.offset.unwrap_or(0) as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            let millis: i64 = row.get(0)?;
            Ok(AuditRecord {
                timestamp: DateTime::from_timestamp_millis(millis),
                request_id: row.get(1)?,
                user_id: row.get(2)?,
                role: row.get(3)?,
                action: row.get(4)?,
                resource: row.get(5)?,
                method: row.get(6)?,
                path: row.get(7)?,
                status_code: row.get::<_, i64>(8)? as u16,
                duration_ms: row.get::<_, i64>(9)? as u64,
                remote_addr: row.get(10)?,
                session_id: row.get(11)?,
                approval_id: row.get(12)?,
                error: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<usize, AuditError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let cutoff = now.timestamp_millis() - self.retention.as_millis() as i64;
        let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(AuditError::Closed)?;
        Ok(conn.execute("DELETE FROM audit_records WHERE timestamp < ?1", params![cutoff])?)
    }

    pub fn start_cleanup(self: &Arc<Self>, every: Duration) {
        if self.db.is_none() {
            return;
        }
        let store = Arc::downgrade(self);
        let task = PeriodicTask::spawn("audit-cleanup", every, move || {
            let store = store.clone();
            async move {
                let Some(store) = store.upgrade() else {
                    return;
                };
                match store.cleanup_at(Utc::now()) {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "audit cleanup"),
                    Err(err) => warn!(%err, "audit cleanup failed"),
                }
            }
        });
        *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(task));
    }

    pub async fn stop_cleanup(&self) {
        let task = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Closes both handles. Every handle is released; the first error wins.
    pub fn close(&self) -> Result<(), AuditError> {
        let mut first: Option<AuditError> = None;
        if let Some(file) = self
            .jsonl
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if let Err(err) = file.sync_all() {
                first.get_or_insert(AuditError::Write(err));
            }
        }
        if let Some(db) = &self.db {
            if let Some(conn) = db.lock().unwrap_or_else(PoisonError::into_inner).take() {
                if let Err((_, err)) = conn.close() {
                    first.get_or_insert(AuditError::Database(err));
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn insert_row(
    conn: &Connection,
    record: &AuditRecord,
    timestamp: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO audit_records (timestamp, request_id, user_id, role, action, resource, method, path,
                                status_code, duration_ms, remote_addr, session_id, approval_id, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            timestamp.timestamp_millis(),
            record.request_id,
            record.user_id,
            record.role,
            record.action,
            record.resource,
            record.method,
            record.path,
            record.status_code as i64,
            record.duration_ms as i64,
            record.remote_addr,
            record.session_id,
            record.approval_id,
            record.error,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite;

    fn record(user: &str, action: &str, session: Option<&str>) -> AuditRecord {
        AuditRecord {
            timestamp: None,
            request_id: format!("req-{user}-{action}"),
            user_id: user.into(),
            role: "operator".into(),
            action: action.into(),
            resource: "sessions".into(),
            method: "POST".into(),
            path: "/api/v1/sessions".into(),
            status_code: 200,
            duration_ms: 4,
            remote_addr: "127.0.0.1:5000".into(),
            session_id: session.map(str::to_string),
            approval_id: None,
            error: None,
        }
    }

    fn indexed(dir: &Path) -> AuditStore {
        let conn = sqlite::open(Path::new(sqlite::IN_MEMORY)).unwrap();
        AuditStore::open(&dir.join("audit/audit.jsonl"), Some(conn), Duration::ZERO).unwrap()
    }

    #[test]
    fn records_go_to_jsonl_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = indexed(dir.path());
        let written = store.record(record("alice", "create", Some("proj"))).unwrap();
        assert!(written.timestamp.is_some());
        store.record(record("bob", "read", None)).unwrap();

        let lines = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(lines.lines().count(), 2);
        let first: AuditRecord = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(first.user_id, "alice");

        let filter = AuditFilter {
            user_id: Some("alice".into()),
            ..AuditFilter::default()
        };
        let rows = store.query(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id.as_deref(), Some("proj"));

        let filter = AuditFilter {
            session_id: Some("proj".into()),
            action: Some("read".into()),
            ..AuditFilter::default()
        };
        assert!(store.query(&filter).unwrap().is_empty());
    }

    #[test]
    fn query_pages_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = indexed(dir.path());
        for i in 0..5 {
            let mut rec = record("alice", "read", None);
            rec.timestamp = Some(Utc::now() + chrono::Duration::seconds(i));
            rec.request_id = format!("req-{i}");
            store.record(rec).unwrap();
        }
        let filter = AuditFilter {
            limit: Some(2),
            offset: Some(1),
            ..AuditFilter::default()
        };
        let rows = store.query(&filter).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
            vec!["req-3", "req-2"]
        );
    }

    #[test]
    fn jsonl_only_store_cannot_query() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            AuditStore::open(&dir.path().join("audit.jsonl"), None, Duration::ZERO).unwrap();
        store.record(record("alice", "read", None)).unwrap();
        assert!(matches!(
            store.query(&AuditFilter::default()),
            Err(AuditError::NoDatabase)
        ));
    }

    #[test]
    fn cleanup_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = indexed(dir.path());
        let mut old = record("alice", "read", None);
        old.timestamp = Some(Utc::now() - chrono::Duration::days(91));
        store.record(old).unwrap();
        store.record(record("bob", "read", None)).unwrap();
        assert_eq!(store.cleanup_at(Utc::now()).unwrap(), 1);

        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.record(record("carol", "read", None)),
            Err(AuditError::Closed)
        ));
    }
    #[test]
    fn index_table_mirrors_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ntm-server.db");
        let store = AuditStore::open(
            &dir.path().join("audit.jsonl"),
            Some(sqlite::open(&db_path).unwrap()),
            Duration::ZERO,
        )
        .unwrap();
        store.record(record("alice", "create", Some("proj"))).unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('audit_records')").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for field in ["timestamp", "request_id", "user_id", "role", "status_code", "session_id", "approval_id"] {
            assert!(columns.iter().any(|column| column == field), "missing column {field}: {columns:?}");
        }
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
