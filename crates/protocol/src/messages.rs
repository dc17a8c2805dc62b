//! Relay messages exchanged over the client WebSocket.
//!
//! Every frame is one JSON text message tagged by `type`:
//!
//! ```json
//! { "type": "create_session", "credentialsRef": "contoso", "tenantId": "contoso" }
//! { "type": "awaiting_second_factor", "sessionId": "6f1c..." }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CredentialVariant, ErrorCode};

/// Messages sent from the browser client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
	/// Authenticates the connection with a short-lived bearer token. Must be first.
	Hello { token: String },
	/// Starts a new automation session for a tenant.
	///
	/// `credentials_ref` names the credential record in the persistence
	/// collaborator; when absent the tenant id is used.
	CreateSession {
		#[serde(default)]
		credentials_ref: Option<String>,
		tenant_id: String,
	},
	/// Re-attaches this connection to an existing session owned by the same operator.
	AttachSession { session_id: String },
	/// Forwards a second-factor code verbatim to the subprocess.
	SubmitSecondFactor { session_id: String, code: String },
	/// Runs one high-level operation from the catalogue.
	RunOperation {
		session_id: String,
		operation: String,
		#[serde(default)]
		args: Value,
	},
	/// Terminates the session and its subprocess.
	CloseSession { session_id: String },
}

impl ClientMessage {
	/// Session targeted by this message, if any.
	pub fn session_id(&self) -> Option<&str> {
		match self {
			ClientMessage::AttachSession { session_id }
			| ClientMessage::SubmitSecondFactor { session_id, .. }
			| ClientMessage::RunOperation { session_id, .. }
			| ClientMessage::CloseSession { session_id } => Some(session_id),
			ClientMessage::Hello { .. } | ClientMessage::CreateSession { .. } => None,
		}
	}

	/// Short label used in logs. Never includes secret material.
	pub fn kind(&self) -> &'static str {
		match self {
			ClientMessage::Hello { .. } => "hello",
			ClientMessage::CreateSession { .. } => "create_session",
			ClientMessage::AttachSession { .. } => "attach_session",
			ClientMessage::SubmitSecondFactor { .. } => "submit_second_factor",
			ClientMessage::RunOperation { .. } => "run_operation",
			ClientMessage::CloseSession { .. } => "close_session",
		}
	}
}

/// Messages sent from the relay to the browser client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
	Welcome {
		operator: String,
		version: String,
	},
	Rejected {
		reason: String,
	},
	SessionCreated {
		session_id: String,
		tenant_id: String,
		variant: CredentialVariant,
	},
	AwaitingSecondFactor {
		session_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		prompt: Option<String>,
	},
	Connected {
		session_id: String,
	},
	OperationResult {
		session_id: String,
		operation: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		result: Option<Value>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<ErrorBody>,
	},
	/// Raw subprocess output for diagnostic display.
	Output {
		session_id: String,
		text: String,
	},
	SessionClosed {
		session_id: String,
		reason: String,
	},
	Error {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		session_id: Option<String>,
		#[serde(flatten)]
		error: ErrorBody,
	},
}

/// Error payload shared by `operation_result` and `error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
	pub code: ErrorCode,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry_hint: Option<String>,
}

impl ErrorBody {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			retry_hint: None,
		}
	}

	pub fn with_retry_hint(mut self, hint: impl Into<String>) -> Self {
		self.retry_hint = Some(hint.into());
		self
	}
}
