//! Append-only audit trail backed by sqlite.
//!
//! The schema is created by an explicit, idempotent migration step run once
//! at startup, before the service accepts traffic. Appends come in two
//! modes: synchronous (failure propagates to the caller, who must treat it
//! as a failed request) and detached (inside a background delegation task,
//! failure is logged and swallowed).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    #[error("audit payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("audit store lock poisoned")]
    LockPoisoned,
}

/// Thread-safe handle over a single sqlite connection. Cloning is cheap;
/// access is serialized through a mutex, which is fine for sqlite.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations before returning.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| AuditError::Io {
                path: parent.to_path_buf(),
                source: error,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        tracing::info!(target: "datawash.audit", path = %path.display(), "audit database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database (tests). Runs all migrations.
    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, AuditError>
    where
        F: FnOnce(&Connection) -> Result<T, AuditError>,
    {
        let conn = self.conn.lock().map_err(|_| AuditError::LockPoisoned)?;
        f(&conn)
    }
}

/// Closed set of lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    JobCreated,
    FileReceived,
    AnalysisEnqueued,
    AnalysisStarted,
    AnalysisCompleted,
    AnalysisFailed,
    CleaningEnqueued,
    CleaningStarted,
    RuleApplied,
    CleaningCompleted,
    CleaningFailed,
    JobDeleted,
}

impl AuditEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::FileReceived => "file_received",
            Self::AnalysisEnqueued => "analysis_enqueued",
            Self::AnalysisStarted => "analysis_started",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisFailed => "analysis_failed",
            Self::CleaningEnqueued => "cleaning_enqueued",
            Self::CleaningStarted => "cleaning_started",
            Self::RuleApplied => "rule_applied",
            Self::CleaningCompleted => "cleaning_completed",
            Self::CleaningFailed => "cleaning_failed",
            Self::JobDeleted => "job_deleted",
        }
    }
}

/// A stored audit row, read back for reports and tests.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEventRow {
    pub id: i64,
    pub job_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
    pub created_at: String,
}

#[derive(Clone)]
pub struct AuditTrail {
    db: Database,
}

impl AuditTrail {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Raw handle to the backing store.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Appends one event, durably written before this returns. Callers on
    /// the request path must propagate the error as a request failure.
    pub fn append(
        &self,
        job_id: Option<&str>,
        kind: AuditEventKind,
        payload: &Value,
    ) -> Result<(), AuditError> {
        let encoded = serde_json::to_string(payload)?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_events (job_id, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_id, kind.as_str(), encoded, created_at],
            )?;
            Ok(())
        })
    }

    /// Append for background tasks running after the client-visible
    /// response committed: a failed write is logged, never fatal.
    pub fn append_detached(&self, job_id: Option<&str>, kind: AuditEventKind, payload: &Value) {
        if let Err(error) = self.append(job_id, kind, payload) {
            tracing::error!(
                target: "datawash.audit",
                job_id = job_id.unwrap_or("-"),
                event_type = kind.as_str(),
                error = %error,
                "detached audit append failed; event lost",
            );
        }
    }

    /// Events for one job in insertion order.
    pub fn events_for_job(&self, job_id: &str) -> Result<Vec<AuditEventRow>, AuditError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, event_type, payload, created_at
                 FROM audit_events WHERE job_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, job_id, event_type, payload, created_at) = row?;
                events.push(AuditEventRow {
                    id,
                    job_id,
                    event_type,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    created_at,
                });
            }
            Ok(events)
        })
    }

    /// Liveness probe: a trivial query against the relational store.
    pub fn ping(&self) -> Result<(), AuditError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

pub mod migrations {
    //! Versioned migration runner. Applied versions are tracked in a
    //! `_migrations` table; each migration runs at most once.

    use rusqlite::Connection;

    use super::AuditError;

    struct Migration {
        version: u32,
        description: &'static str,
        sql: &'static str,
    }

    const MIGRATIONS: &[Migration] = &[
        Migration {
            version: 1,
            description: "create_audit_events_table",
            sql: include_str!("sql/001_create_audit_events.sql"),
        },
        Migration {
            version: 2,
            description: "index_audit_events_job_id",
            sql: include_str!("sql/002_index_audit_events_job_id.sql"),
        },
    ];

    /// Runs all pending migrations. Safe to call repeatedly.
    pub fn run_all(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;

        let current_version: u32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(
                target: "datawash.audit",
                version = migration.version,
                description = migration.description,
                "running migration",
            );

            conn.execute_batch(migration.sql)
                .map_err(|error| AuditError::Migration {
                    version: migration.version,
                    reason: error.to_string(),
                })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
                rusqlite::params![migration.version, migration.description],
            )?;
        }

        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn migrations_run_on_fresh_db() {
            let conn = Connection::open_in_memory().unwrap();
            run_all(&conn).unwrap();

            let count: u32 = conn
                .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, MIGRATIONS.len() as u32);
        }

        #[test]
        fn migrations_are_idempotent() {
            let conn = Connection::open_in_memory().unwrap();
            run_all(&conn).unwrap();
            run_all(&conn).unwrap();

            let count: u32 = conn
                .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, MIGRATIONS.len() as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trail() -> AuditTrail {
        AuditTrail::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn append_then_read_back_preserves_order() {
        let trail = trail();
        trail
            .append(Some("job_1"), AuditEventKind::JobCreated, &json!({"owner": "u1"}))
            .unwrap();
        trail
            .append(Some("job_1"), AuditEventKind::AnalysisEnqueued, &json!({}))
            .unwrap();
        trail
            .append(Some("job_2"), AuditEventKind::JobCreated, &json!({}))
            .unwrap();

        let events = trail.events_for_job("job_1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "job_created");
        assert_eq!(events[0].payload["owner"], "u1");
        assert_eq!(events[1].event_type, "analysis_enqueued");
    }

    #[test]
    fn ping_succeeds_on_open_database() {
        trail().ping().unwrap();
    }

    #[test]
    fn broken_store_fails_sync_append_but_not_detached() {
        let trail = trail();
        trail
            .db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE audit_events")?;
                Ok(())
            })
            .unwrap();

        let error = trail
            .append(Some("job_1"), AuditEventKind::JobCreated, &json!({}))
            .unwrap_err();
        assert!(matches!(error, AuditError::Sqlite(_)));

        // The detached mode logs the loss and returns normally.
        trail.append_detached(Some("job_1"), AuditEventKind::AnalysisStarted, &json!({}));
    }

    #[test]
    fn events_are_never_mutated_by_second_append() {
        let trail = trail();
        trail
            .append(Some("job_1"), AuditEventKind::RuleApplied, &json!({"rule": "trim"}))
            .unwrap();
        trail
            .append(Some("job_1"), AuditEventKind::RuleApplied, &json!({"rule": "dedup"}))
            .unwrap();

        let events = trail.events_for_job("job_1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["rule"], "trim");
        assert_eq!(events[1].payload["rule"], "dedup");
        assert!(events[0].id < events[1].id);
    }
}
