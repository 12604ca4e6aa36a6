//! One audit record per guarded call.
//!
//! Records always go to the `audit` tracing target. When
//! `guardrails.audit_log_path` is set they are also appended to that file as
//! JSON lines; a failed file write is reported but does not suppress the
//! tracing record.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub operation: String,
    pub caller: String,
    /// `ok` or an error code.
    pub outcome: String,
    pub result_count: usize,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Audit sink: the `audit` tracing target plus an optional JSONL file.
pub struct AuditLog {
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let sink = match path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("Failed to open audit log: {}", p.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { sink })
    }

    /// Emit one record. File errors are logged, never returned.
    pub fn record(&self, record: &AuditRecord) {
        tracing::info!(
            target: "audit",
            operation = %record.operation,
            caller = %record.caller,
            outcome = %record.outcome,
            result_count = record.result_count,
            latency_ms = record.latency_ms,
            query = record.query.as_deref().unwrap_or(""),
            "call"
        );

        if let Some(sink) = &self.sink {
            let line = match serde_json::to_string(record) {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(error = %e, "audit record not serializable");
                    return;
                }
            };
            let mut file = sink.lock();
            if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                tracing::error!(error = %e, "audit log write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(query: Option<&str>) -> AuditRecord {
        AuditRecord {
            timestamp: "2024-05-01T00:00:00Z".into(),
            operation: "searchFiles".into(),
            caller: "cli".into(),
            outcome: "ok".into(),
            result_count: 3,
            latency_ms: 12,
            query: query.map(String::from),
        }
    }

    #[test]
    fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");
        let log = AuditLog::open(Some(&path)).unwrap();
        log.record(&record(None));
        log.record(&record(Some("budget")));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["operation"], "searchFiles");
        assert!(lines[0].get("query").is_none());
        assert_eq!(lines[1]["query"], "budget");
    }
}
