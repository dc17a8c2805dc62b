use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One audit entry emitted per completed high-level operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
	/// Milliseconds since the Unix epoch.
	pub at_ms: u64,
	pub operator: String,
	pub tenant: String,
	pub session_id: String,
	/// The user or resource the operation targeted; `None` for tenant-wide reads.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target_identity: Option<String>,
	/// Operation name, e.g. `assign_phone_number`.
	pub change_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub before_state: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub after_state: Option<Value>,
	pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
	Success,
	Failure { code: String, message: String },
}

impl AuditOutcome {
	pub fn is_success(&self) -> bool {
		matches!(self, AuditOutcome::Success)
	}
}
