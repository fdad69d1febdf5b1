//! Session audit log.
//!
//! Every finished binkp session (polled, answered or crash delivery) is
//! handed to a [`SessionLog`]. [`FileSessionLog`] appends one JSON object per
//! line under an exclusive `fs2` lock so concurrent session tasks and separate
//! processes (a `poll` run next to the daemon) never interleave records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::binkp::SessionSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub role: String,
    pub peer: String,
    pub remote_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub auth_method: Option<String>,
    pub files_sent: Vec<String>,
    pub files_received: Vec<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub remote_system: Option<String>,
    pub remote_version: Option<String>,
}

impl SessionRecord {
    pub fn from_summary(
        summary: &SessionSummary,
        started_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        Self {
            session_id: summary.session_id.clone(),
            role: summary.role.to_string(),
            peer: summary.peer.clone(),
            remote_address: summary.remote_address.clone(),
            started_at,
            duration_ms,
            success: error.is_none(),
            error,
            auth_method: summary.auth_method.map(|a| a.as_str().to_string()),
            files_sent: summary.files_sent.clone(),
            files_received: summary.files_received.clone(),
            bytes_sent: summary.bytes_sent,
            bytes_received: summary.bytes_received,
            remote_system: summary.remote_info.system.clone(),
            remote_version: summary.remote_info.version.clone(),
        }
    }
}

pub trait SessionLog: Send + Sync {
    fn record(&self, record: &SessionRecord) -> Result<()>;
}

/// Discards everything; used when no session log is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSessionLog;

impl SessionLog for NullSessionLog {
    fn record(&self, _record: &SessionRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileSessionLog {
    path: PathBuf,
}

impl FileSessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last `limit` records, oldest first. Lines that do not parse are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("open {}", self.path.display())),
        };
        file.lock_shared()?;
        let mut records: Vec<SessionRecord> = BufReader::new(&file)
            .lines()
            .map_while(|l| l.ok())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect();
        file.unlock()?;
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }
}

impl SessionLog for FileSessionLog {
    fn record(&self, record: &SessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open session log {}", self.path.display()))?;
        file.lock_exclusive()?;
        let res = file.write_all(line.as_bytes()).and_then(|_| file.flush());
        file.unlock()?;
        res?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, success: bool) -> SessionRecord {
        SessionRecord {
            session_id: id.into(),
            role: "answerer".into(),
            peer: "127.0.0.1:4000".into(),
            remote_address: Some("1:153/150@fidonet".into()),
            started_at: Utc::now(),
            duration_ms: 12,
            success,
            error: (!success).then(|| "read timed out".to_string()),
            auth_method: Some("password".into()),
            files_sent: vec![],
            files_received: vec!["a.pkt".into()],
            bytes_sent: 0,
            bytes_received: 10,
            remote_system: Some("Remote BBS".into()),
            remote_version: None,
        }
    }

    #[test]
    fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileSessionLog::new(dir.path().join("logs").join("sessions.jsonl"));
        for i in 0..5 {
            log.record(&record(&format!("s{}", i), i % 2 == 0)).unwrap();
        }
        let recent = log.recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].session_id, "s2");
        assert_eq!(recent[2].session_id, "s4");
        assert!(!recent[1].success);
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileSessionLog::new(dir.path().join("none.jsonl"));
        assert!(log.recent(10).unwrap().is_empty());
    }
}
