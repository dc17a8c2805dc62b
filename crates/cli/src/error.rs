use std::path::PathBuf;

use tenantshell_protocol::{ErrorBody, ErrorCode};

/// Errors raised by the relay server and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
	#[error(transparent)]
	Runtime(#[from] tenantshell_runtime::Error),

	#[error("connection is not authenticated")]
	Unauthenticated,

	#[error("operator `{operator}` is not authorized for tenant `{tenant}`")]
	Forbidden { operator: String, tenant: String },

	#[error("session {0} belongs to another operator")]
	NotOwner(String),

	#[error("{0}")]
	InvalidInput(String),

	#[error("no credentials configured for `{0}`")]
	UnknownTenant(String),

	#[error("credential store: {0}")]
	Credentials(String),

	#[error("audit append failed: {0}")]
	Audit(String),

	#[error("config file {path}: {message}")]
	Config { path: PathBuf, message: String },

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
	pub fn code(&self) -> ErrorCode {
		match self {
			RelayError::Runtime(e) => e.code(),
			RelayError::Unauthenticated => ErrorCode::ProtocolViolation,
			RelayError::Forbidden { .. } | RelayError::NotOwner(_) => ErrorCode::Forbidden,
			RelayError::InvalidInput(_) | RelayError::UnknownTenant(_) => ErrorCode::InvalidInput,
			RelayError::Audit(_) => ErrorCode::AuditFailed,
			RelayError::Credentials(_) | RelayError::Config { .. } | RelayError::Io(_) => ErrorCode::InternalError,
		}
	}

	/// Client-facing body. Credential store details stay in the server log.
	pub fn to_body(&self) -> ErrorBody {
		match self {
			RelayError::Runtime(e) => e.to_body(),
			RelayError::Credentials(_) => ErrorBody::new(self.code(), "credentials could not be loaded"),
			_ => ErrorBody::new(self.code(), self.to_string()),
		}
	}
}
