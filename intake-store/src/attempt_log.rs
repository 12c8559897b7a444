//! SQLite-based log of registration attempts
//!
//! One row per gate verification or submission attempt. Field values are
//! never written here, only which session did what and how it ended.

use crate::error::Result;
use rusqlite::{Connection, params};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptEvent {
    Verification,
    Upload,
    Submission,
}

impl AttemptEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptEvent::Verification => "verification",
            AttemptEvent::Upload => "upload",
            AttemptEvent::Submission => "submission",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Rejected,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Accepted => "accepted",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptEntry {
    pub timestamp: String,
    pub session: String,
    pub role: String,
    pub event: String,
    pub outcome: String,
    pub detail: Option<String>,
}

pub struct AttemptLog {
    conn: Connection,
}

#[allow(clippy::result_large_err)]
impl AttemptLog {
    /// Open the log (create if not exists)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let log = Self { conn };
        log.initialize()?;
        Ok(log)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS attempt_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                session TEXT NOT NULL,
                role TEXT NOT NULL,
                event TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT
            )
            "#,
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attempt_session ON attempt_log(session)",
            [],
        )?;

        Ok(())
    }

    pub fn record(
        &self,
        session: &str,
        role: &str,
        event: AttemptEvent,
        outcome: AttemptOutcome,
        detail: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO attempt_log (session, role, event, outcome, detail)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![session, role, event.as_str(), outcome.as_str(), detail],
        )?;
        Ok(())
    }

    /// Newest entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AttemptEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, session, role, event, outcome, detail
            FROM attempt_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AttemptEntry {
                timestamp: row.get(0)?,
                session: row.get(1)?,
                role: row.get(2)?,
                event: row.get(3)?,
                outcome: row.get(4)?,
                detail: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let log = AttemptLog::open(":memory:").unwrap();

        log.record(
            "s1",
            "doctor",
            AttemptEvent::Verification,
            AttemptOutcome::Rejected,
            Some("expired"),
        )
        .unwrap();
        log.record(
            "s1",
            "doctor",
            AttemptEvent::Verification,
            AttemptOutcome::Accepted,
            None,
        )
        .unwrap();
        log.record(
            "s2",
            "staff",
            AttemptEvent::Submission,
            AttemptOutcome::Failed,
            Some("Network error. Check your connection and try again."),
        )
        .unwrap();

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].session, "s2");
        assert_eq!(entries[0].event, "submission");
        assert_eq!(entries[0].outcome, "failed");
        assert_eq!(entries[2].detail.as_deref(), Some("expired"));
    }

    #[test]
    fn test_recent_respects_limit() {
        let log = AttemptLog::open(":memory:").unwrap();
        for _ in 0..5 {
            log.record(
                "s1",
                "patient",
                AttemptEvent::Submission,
                AttemptOutcome::Accepted,
                None,
            )
            .unwrap();
        }
        assert_eq!(log.recent(2).unwrap().len(), 2);
        assert_eq!(log.recent(50).unwrap().len(), 5);
    }
}
