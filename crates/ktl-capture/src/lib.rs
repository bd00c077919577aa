//! Append-only SQLite capture of deploy sessions.
//!
//! Three tables: `sessions` (one row per invocation), `events` (every
//! stream event, `log` and `deploy` rows), and `artifacts` (named text
//! blobs like the rendered manifest or the plan JSON). WAL journaling,
//! foreign keys on. The recorder runs as an ordinary observer on its own
//! delivery thread.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};

use ktl_events::Observer;
use ktl_types::{EventKind, LogLevel, LogPayload, StreamEvent};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    command    TEXT NOT NULL,
    meta_json  TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at   TEXT
);
CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(session_id),
    ts         TEXT NOT NULL,
    kind       TEXT NOT NULL CHECK (kind IN ('log', 'deploy')),
    level      TEXT,
    source     TEXT,
    namespace  TEXT,
    pod        TEXT,
    container  TEXT,
    stream     TEXT,
    message    TEXT,
    raw_json   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS artifacts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(session_id),
    ts         TEXT NOT NULL,
    name       TEXT NOT NULL,
    text       TEXT NOT NULL
);
";

/// Recorder observer plus its artifact side-channel.
pub struct CaptureRecorder {
    conn: Arc<Mutex<Connection>>,
    session_id: String,
}

/// Writes named artifacts into an open capture session. Cheap to clone;
/// usable after the recorder itself has been attached to a bus.
#[derive(Clone)]
pub struct ArtifactWriter {
    conn: Arc<Mutex<Connection>>,
    session_id: String,
}

impl CaptureRecorder {
    /// Open (or create) a capture database and start a new session.
    pub fn open(path: &Path, command: &str, meta: &serde_json::Value) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open capture db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA)
            .context("failed to create capture schema")?;

        let session_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            std::process::id()
        );
        conn.execute(
            "INSERT INTO sessions (session_id, command, meta_json, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                command,
                meta.to_string(),
                Utc::now().to_rfc3339()
            ],
        )
        .context("failed to insert capture session")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn artifact_writer(&self) -> ArtifactWriter {
        ArtifactWriter {
            conn: Arc::clone(&self.conn),
            session_id: self.session_id.clone(),
        }
    }

    fn insert_event(
        &self,
        event: &StreamEvent,
        kind: &str,
        log: Option<&LogPayload>,
    ) -> Result<()> {
        let raw = serde_json::to_string(event).context("failed to serialize event")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (session_id, ts, kind, level, source, namespace, pod, container, stream, message, raw_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                self.session_id,
                event.timestamp_rfc3339(),
                kind,
                log.map(|l| level_str(l.level)),
                log.map(|l| l.source.as_str()),
                log.and_then(|l| l.namespace.as_deref()),
                log.and_then(|l| l.pod.as_deref()),
                log.and_then(|l| l.container.as_deref()),
                log.and_then(|l| l.stream.as_deref()),
                log.map(|l| l.message.as_str()),
                raw,
            ],
        )
        .context("failed to insert capture event")?;
        Ok(())
    }
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

impl Observer for CaptureRecorder {
    fn name(&self) -> &str {
        "capture"
    }

    fn handle_deploy_event(&mut self, event: &StreamEvent) -> Result<()> {
        debug_assert!(!matches!(event.event, EventKind::Log(_)));
        self.insert_event(event, "deploy", None)
    }

    fn observe_log(&mut self, event: &StreamEvent, log: &LogPayload) -> Result<()> {
        self.insert_event(event, "log", Some(log))
    }

    fn close(&mut self) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE session_id = ?2",
            params![Utc::now().to_rfc3339(), self.session_id],
        );
    }
}

impl ArtifactWriter {
    pub fn record(&self, name: &str, text: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO artifacts (session_id, ts, name, text) VALUES (?1, ?2, ?3, ?4)",
            params![self.session_id, Utc::now().to_rfc3339(), name, text],
        )
        .context("failed to insert capture artifact")?;
        Ok(())
    }
}
