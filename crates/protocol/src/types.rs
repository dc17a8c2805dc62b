use serde::{Deserialize, Serialize};

/// Lifecycle state of an automation session.
///
/// Transitions are monotonic forward, with `AwaitingSecondFactor -> Connecting`
/// and `Executing -> Connected` as the only loops. Any state may move
/// directly to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	Created,
	Connecting,
	AwaitingSecondFactor,
	Connected,
	Executing,
	Terminated,
}

impl SessionState {
	/// Returns `true` once the remote directory has accepted the credential.
	pub fn is_connected(self) -> bool {
		matches!(self, SessionState::Connected | SessionState::Executing)
	}

	pub fn is_terminated(self) -> bool {
		self == SessionState::Terminated
	}

	/// Whether moving from `self` to `next` is a legal transition.
	pub fn can_transition_to(self, next: SessionState) -> bool {
		use SessionState::*;
		match (self, next) {
			(Terminated, _) => false,
			(_, Terminated) => true,
			(Created, Connecting) => true,
			(Connecting, AwaitingSecondFactor | Connected) => true,
			(AwaitingSecondFactor, Connecting) => true,
			(Connected, Executing) => true,
			(Executing, Connected) => true,
			_ => false,
		}
	}
}

impl std::fmt::Display for SessionState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			SessionState::Created => "created",
			SessionState::Connecting => "connecting",
			SessionState::AwaitingSecondFactor => "awaiting_second_factor",
			SessionState::Connected => "connected",
			SessionState::Executing => "executing",
			SessionState::Terminated => "terminated",
		};
		f.write_str(s)
	}
}

/// Which authentication flow a session was created with.
///
/// This is the wire-visible tag only; secret material never crosses the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialVariant {
	Certificate,
	Interactive,
}

impl std::fmt::Display for CredentialVariant {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CredentialVariant::Certificate => f.write_str("certificate"),
			CredentialVariant::Interactive => f.write_str("interactive"),
		}
	}
}

/// Standardized error codes for programmatic handling by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	LaunchFailure,
	AuthFailure,
	Timeout,
	MalformedResult,
	ProtocolViolation,
	ResourceExhausted,
	CommandFailed,
	SessionNotFound,
	SessionClosed,
	Forbidden,
	InvalidInput,
	AuditFailed,
	InternalError,
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorCode::LaunchFailure => write!(f, "LAUNCH_FAILURE"),
			ErrorCode::AuthFailure => write!(f, "AUTH_FAILURE"),
			ErrorCode::Timeout => write!(f, "TIMEOUT"),
			ErrorCode::MalformedResult => write!(f, "MALFORMED_RESULT"),
			ErrorCode::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
			ErrorCode::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
			ErrorCode::CommandFailed => write!(f, "COMMAND_FAILED"),
			ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
			ErrorCode::SessionClosed => write!(f, "SESSION_CLOSED"),
			ErrorCode::Forbidden => write!(f, "FORBIDDEN"),
			ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
			ErrorCode::AuditFailed => write!(f, "AUDIT_FAILED"),
			ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
		}
	}
}

/// Hint attached to every terminal failure.
pub const RETRY_HINT_NEW_SESSION: &str = "start a new session";

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn loops_are_the_only_backward_edges() {
		use SessionState::*;
		assert!(Created.can_transition_to(Connecting));
		assert!(Connecting.can_transition_to(AwaitingSecondFactor));
		assert!(AwaitingSecondFactor.can_transition_to(Connecting));
		assert!(Connected.can_transition_to(Executing));
		assert!(Executing.can_transition_to(Connected));

		assert!(!Connected.can_transition_to(Connecting));
		assert!(!Connected.can_transition_to(AwaitingSecondFactor));
		assert!(!AwaitingSecondFactor.can_transition_to(Connected));
		assert!(!Created.can_transition_to(Connected));
	}

	#[test]
	fn any_live_state_may_terminate() {
		use SessionState::*;
		for state in [Created, Connecting, AwaitingSecondFactor, Connected, Executing] {
			assert!(state.can_transition_to(Terminated), "{state} should terminate");
		}
		assert!(!Terminated.can_transition_to(Terminated));
		assert!(!Terminated.can_transition_to(Connected));
	}

	#[test]
	fn error_code_display_matches_wire_form() {
		for code in [ErrorCode::LaunchFailure, ErrorCode::ProtocolViolation, ErrorCode::AuditFailed] {
			let wire = serde_json::to_value(code).unwrap();
			assert_eq!(wire, serde_json::Value::String(code.to_string()));
		}
	}

	#[test]
	fn session_state_serializes_snake_case() {
		let value = serde_json::to_value(SessionState::AwaitingSecondFactor).unwrap();
		assert_eq!(value, "awaiting_second_factor");
		assert_eq!(SessionState::AwaitingSecondFactor.to_string(), "awaiting_second_factor");
	}
}
