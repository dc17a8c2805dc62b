//! Audit sinks. One record is appended per completed operation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tenantshell_protocol::AuditRecord;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{RelayError, Result};

#[async_trait]
pub trait AuditSink: Send + Sync {
	async fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// Appends one JSON object per line. Parent directories are created on first write.
#[derive(Debug)]
pub struct JsonlAuditSink {
	path: PathBuf,
	lock: Mutex<()>,
}

impl JsonlAuditSink {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
	async fn append(&self, record: &AuditRecord) -> Result<()> {
		let mut line = serde_json::to_string(record).map_err(|e| RelayError::Audit(e.to_string()))?;
		line.push('\n');

		let _guard = self.lock.lock().await;
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				tokio::fs::create_dir_all(parent)
					.await
					.map_err(|e| RelayError::Audit(format!("{}: {e}", parent.display())))?;
			}
		}
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await
			.map_err(|e| RelayError::Audit(format!("{}: {e}", self.path.display())))?;
		file.write_all(line.as_bytes())
			.await
			.map_err(|e| RelayError::Audit(format!("{}: {e}", self.path.display())))?;
		file.flush().await.map_err(|e| RelayError::Audit(e.to_string()))
	}
}

/// Keeps records in memory. `fail_appends` makes every append fail.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
	records: SyncMutex<Vec<AuditRecord>>,
	failing: AtomicBool,
}

impl MemoryAuditSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fail_appends(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn records(&self) -> Vec<AuditRecord> {
		self.records.lock().clone()
	}
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
	async fn append(&self, record: &AuditRecord) -> Result<()> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(RelayError::Audit("audit sink unavailable".into()));
		}
		self.records.lock().push(record.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tenantshell_protocol::AuditOutcome;

	use super::*;

	fn record(change: &str) -> AuditRecord {
		AuditRecord {
			at_ms: 1_700_000_000_000,
			operator: "alice".into(),
			tenant: "contoso".into(),
			session_id: "s-1".into(),
			target_identity: Some("bob@contoso.com".into()),
			change_type: change.into(),
			before_state: Some(json!({"LineUri": null})),
			after_state: None,
			outcome: AuditOutcome::Success,
		}
	}

	#[tokio::test]
	async fn jsonl_sink_appends_lines() {
		let dir = tempfile::TempDir::new().unwrap();
		let sink = JsonlAuditSink::new(dir.path().join("nested").join("audit.jsonl"));
		sink.append(&record("get_user")).await.unwrap();
		sink.append(&record("assign_phone_number")).await.unwrap();

		let content = std::fs::read_to_string(sink.path()).unwrap();
		let lines: Vec<AuditRecord> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[1].change_type, "assign_phone_number");
	}

	#[tokio::test]
	async fn memory_sink_failure_injection() {
		let sink = MemoryAuditSink::new();
		sink.fail_appends(true);
		assert!(matches!(sink.append(&record("get_user")).await, Err(RelayError::Audit(_))));
		sink.fail_appends(false);
		sink.append(&record("get_user")).await.unwrap();
		assert_eq!(sink.records().len(), 1);
	}
}
