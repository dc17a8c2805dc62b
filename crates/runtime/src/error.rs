use std::time::Duration;

use tenantshell_protocol::{ErrorBody, ErrorCode, RETRY_HINT_NEW_SESSION};

use crate::session::SessionId;

/// Errors produced by the session runtime.
///
/// Errors are organized by how far they reach:
/// - Terminal: the session is destroyed (`LaunchFailure`, `AuthFailure`,
///   authentication `Timeout`, `SessionClosed`, `Io`)
/// - Per-operation: only the offending command fails (`MalformedResult`,
///   `CommandFailed`, command `Timeout`)
/// - Rejections: nothing is mutated (`ProtocolViolation`, `ResourceExhausted`, `NotFound`)
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The shell program could not be located.
	#[error("shell program not found (searched: {searched})")]
	ShellNotFound { searched: String },

	/// The shell process could not be started.
	#[error("failed to launch `{program}`: {source}")]
	LaunchFailure {
		program: String,
		#[source]
		source: std::io::Error,
	},

	/// The remote directory rejected the credential, or the shell exited before connecting.
	#[error("authentication failed: {message}")]
	AuthFailure { message: String, output_tail: Vec<String> },

	#[error("{what} timed out after {after:?}")]
	Timeout { what: TimeoutKind, after: Duration },

	/// A structured block did not parse as JSON.
	#[error("malformed structured result: {message}")]
	MalformedResult { message: String, raw: String },

	/// The command reported an explicit failure marker.
	#[error("command failed: {0}")]
	CommandFailed(String),

	/// The request does not fit the session's current state.
	#[error("protocol violation: {0}")]
	ProtocolViolation(String),

	#[error("resource exhausted: {0}")]
	ResourceExhausted(String),

	#[error("session {0} not found")]
	NotFound(SessionId),

	/// The session terminated before the request could complete.
	#[error("session closed: {0}")]
	SessionClosed(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

/// Which bounded wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
	Authentication,
	Command,
	SecondFactor,
}

impl std::fmt::Display for TimeoutKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TimeoutKind::Authentication => f.write_str("authentication"),
			TimeoutKind::Command => f.write_str("command"),
			TimeoutKind::SecondFactor => f.write_str("second factor"),
		}
	}
}

/// A specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub fn code(&self) -> ErrorCode {
		match self {
			Error::ShellNotFound { .. } | Error::LaunchFailure { .. } => ErrorCode::LaunchFailure,
			Error::AuthFailure { .. } => ErrorCode::AuthFailure,
			Error::Timeout { .. } => ErrorCode::Timeout,
			Error::MalformedResult { .. } => ErrorCode::MalformedResult,
			Error::CommandFailed(_) => ErrorCode::CommandFailed,
			Error::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
			Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
			Error::NotFound(_) => ErrorCode::SessionNotFound,
			Error::SessionClosed(_) => ErrorCode::SessionClosed,
			Error::Io(_) => ErrorCode::InternalError,
		}
	}

	/// Whether this error ends the session it occurred in.
	pub fn is_terminal(&self) -> bool {
		match self {
			Error::ShellNotFound { .. } | Error::LaunchFailure { .. } | Error::AuthFailure { .. } | Error::SessionClosed(_) | Error::Io(_) => true,
			Error::Timeout { what, .. } => *what != TimeoutKind::Command,
			_ => false,
		}
	}

	pub fn retry_hint(&self) -> Option<&'static str> {
		self.is_terminal().then_some(RETRY_HINT_NEW_SESSION)
	}

	/// Client-facing error body. Output tails stay server-side.
	pub fn to_body(&self) -> ErrorBody {
		let body = ErrorBody::new(self.code(), self.to_string());
		match self.retry_hint() {
			Some(hint) => body.with_retry_hint(hint),
			None => body,
		}
	}
}
