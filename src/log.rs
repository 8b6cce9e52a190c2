//! JSONL journal of clone and restore runs
//!
//! The orchestrator appends one record per finished run, stamped with
//! the outcome and the byte count the hub actually moved, so operators
//! can audit what was written where. Journal failures never fail a
//! run; the caller downgrades them to warnings.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// One finished run. `source` and `destination` name the endpoints the
/// way the job saw them: a device path, an image path, or a transport
/// (`unicast`, `multicast`, `link`).
#[derive(Serialize, Deserialize, Debug)]
pub struct RunRecord {
    pub finished_at: String,
    pub role: String,
    pub mode: String,
    pub source: String,
    pub destination: String,
    pub outcome: RunOutcome,
    pub bytes_transferred: u64,
    pub seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn finish(
        role: &str,
        mode: &str,
        source: String,
        destination: String,
        outcome: RunOutcome,
        bytes_transferred: u64,
        seconds: f64,
        error: Option<String>,
    ) -> Self {
        RunRecord {
            finished_at: Utc::now().to_rfc3339(),
            role: role.to_string(),
            mode: mode.to_string(),
            source,
            destination,
            outcome,
            bytes_transferred,
            seconds,
            error,
        }
    }
}

pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RunLog { path: path.into() }
    }

    /// Append one record as a single JSON line.
    pub fn append(&self, record: &RunRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| Error::WriteData(e.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|_| Error::WriteData(self.path.display().to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|_| Error::WriteData(self.path.display().to_string()))
    }

    /// All recorded runs, oldest first. A journal that does not exist
    /// yet is simply empty.
    pub fn entries(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|_| Error::ReadData(self.path.display().to_string()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| Error::ReadData(format!("{}: {e}", self.path.display())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: RunOutcome, bytes: u64) -> RunRecord {
        RunRecord::finish(
            "send",
            "local",
            "/dev/sda".into(),
            "/backups/sda.dc".into(),
            outcome,
            bytes,
            1.25,
            match outcome {
                RunOutcome::Failed => Some("could not mount /dev/sda1".into()),
                _ => None,
            },
        )
    }

    #[test]
    fn records_accumulate_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("runs.jsonl"));

        log.append(&record(RunOutcome::Completed, 4096)).unwrap();
        log.append(&record(RunOutcome::Failed, 512)).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, RunOutcome::Completed);
        assert_eq!(entries[0].bytes_transferred, 4096);
        assert_eq!(entries[1].outcome, RunOutcome::Failed);
        assert!(entries[1].error.as_deref().unwrap().contains("mount"));
    }

    #[test]
    fn missing_journal_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("never-written.jsonl"));
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn successful_records_omit_the_error_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let log = RunLog::new(&path);
        log.append(&record(RunOutcome::Completed, 1024)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"error\""));
        assert!(raw.contains("\"outcome\":\"completed\""));
    }
}
