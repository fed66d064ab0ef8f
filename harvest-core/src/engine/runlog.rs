use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::error::EngineError;

/// Everything that happens to a run, recovered or not, lands here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunEventKind {
    Interference,
    StepRetry,
    StepFailure,
    NoData,
    TargetError,
    QueueOversized,
    Notification,
    OperatorCue,
    Session,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub kind: RunEventKind,
    pub queue: Option<String>,
    pub target: Option<String>,
    pub step: Option<String>,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<RunLogError> for EngineError {
    fn from(error: RunLogError) -> Self {
        EngineError::Telemetry(error.to_string())
    }
}

/// Structured run log: JSONL append file plus a SQLite mirror for ad-hoc
/// queries after a multi-hour run.
#[derive(Debug)]
pub struct RunLog {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
    run_id: Uuid,
}

impl RunLog {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> Result<Self, RunLogError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let log = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            run_id: Uuid::new_v4(),
        };
        log.initialize_db()?;
        Ok(log)
    }

    fn initialize_db(&self) -> Result<(), RunLogError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS run_events (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT,
                kind TEXT,
                queue TEXT,
                target TEXT,
                step TEXT,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_run_events_ts ON run_events(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, RunLogError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn record(
        &self,
        kind: RunEventKind,
        queue: Option<&str>,
        target: Option<&str>,
        step: Option<&str>,
        detail: impl Into<String>,
    ) -> Result<(), RunLogError> {
        let event = RunEvent {
            timestamp: Utc::now(),
            run_id: self.run_id,
            kind,
            queue: queue.map(str::to_string),
            target: target.map(str::to_string),
            step: step.map(str::to_string),
            detail: detail.into(),
        };
        let json = serde_json::to_string(&event)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO run_events (run_id, kind, queue, target, step, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.run_id.to_string(),
                format!("{:?}", event.kind),
                event.queue,
                event.target,
                event.step,
                event.detail,
            ],
        )?;
        Ok(())
    }
}
