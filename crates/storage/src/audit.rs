use chrono::Utc;
use domshell_core::{safe_truncate, Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

/// Longest summary kept per record, in characters.
pub const MAX_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    DeniedTier,
    DeniedConfirm,
    DeniedDomain,
    Execute,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp_ms: i64,
    pub session_id: String,
    pub correlation_id: String,
    pub command: String,
    pub tier: String,
    pub decision: AuditDecision,
    pub summary: String,
}

/// Append-only JSONL log of gateway decisions. Writes to a fixed file when
/// one is configured, else to one file per day under the audit directory.
pub struct AuditLogger {
    paths: Paths,
    fixed: Option<PathBuf>,
}

impl AuditLogger {
    pub fn new(paths: Paths, fixed: Option<PathBuf>) -> Self {
        Self { paths, fixed }
    }

    pub fn record(
        &mut self,
        session_id: &str,
        correlation_id: &str,
        command: &str,
        tier: &str,
        decision: AuditDecision,
        summary: &str,
    ) -> Result<()> {
        let record = AuditRecord {
            timestamp_ms: Utc::now().timestamp_millis(),
            session_id: session_id.to_string(),
            correlation_id: correlation_id.to_string(),
            command: command.to_string(),
            tier: tier.to_string(),
            decision,
            summary: safe_truncate(summary, MAX_SUMMARY_CHARS).to_string(),
        };
        self.write_record(&record)
    }

    fn write_record(&mut self, record: &AuditRecord) -> Result<()> {
        let log_file = self.current_log_file_path();

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    fn current_log_file_path(&self) -> PathBuf {
        match &self.fixed {
            Some(path) => path.clone(),
            None => {
                let today = Utc::now().format("%Y-%m-%d").to_string();
                self.paths.daily_audit_file(&today)
            }
        }
    }

    /// Read every record from the file currently being written.
    pub fn read_current(&self) -> Result<Vec<AuditRecord>> {
        let log_file = self.current_log_file_path();

        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut records = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse audit record");
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_daily_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_base(temp_dir.path().to_path_buf());
        let mut logger = AuditLogger::new(paths.clone(), None);

        logger
            .record("s1", "c1", "click submit_btn", "write", AuditDecision::DeniedTier, "write disabled")
            .unwrap();
        logger
            .record("s1", "c2", "ls", "read", AuditDecision::Execute, &"x".repeat(500))
            .unwrap();

        let records = logger.read_current().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision, AuditDecision::DeniedTier);
        assert_eq!(records[1].summary.chars().count(), MAX_SUMMARY_CHARS);

        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(paths.daily_audit_file(&today).exists());
    }

    #[test]
    fn test_fixed_file_and_wire_format() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("nested").join("audit.jsonl");
        let mut logger = AuditLogger::new(Paths::with_base(temp_dir.path().to_path_buf()), Some(file.clone()));

        logger
            .record("s9", "c9", "cookies", "sensitive", AuditDecision::DeniedConfirm, "")
            .unwrap();

        let line = std::fs::read_to_string(&file).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["decision"], "DENIED_CONFIRM");
        assert_eq!(value["sessionId"], "s9");
        assert_eq!(value["correlationId"], "c9");
        assert!(value["timestampMs"].as_i64().unwrap() > 0);
    }
}
