//! Credential descriptors handed to the launcher.
//!
//! The variant is decided once, where credentials are loaded, and carried
//! unchanged for the whole session. Nothing downstream inspects which fields
//! happen to be populated.

use tenantshell_protocol::CredentialVariant;

/// Secret material that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the cleartext. Callers must not log the result.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl std::fmt::Debug for Secret {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("Secret(***)")
	}
}

/// How a session authenticates against the remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialDescriptor {
	/// App-only authentication with a certificate installed on this host.
	Certificate {
		application_id: String,
		certificate_thumbprint: String,
		directory_id: String,
	},
	/// Delegated authentication that may pause for a second factor.
	Interactive { username: String, secret: Secret },
}

impl CredentialDescriptor {
	pub fn variant(&self) -> CredentialVariant {
		match self {
			CredentialDescriptor::Certificate { .. } => CredentialVariant::Certificate,
			CredentialDescriptor::Interactive { .. } => CredentialVariant::Interactive,
		}
	}

	/// Secret values that must be redacted from any forwarded output.
	pub fn secrets(&self) -> Vec<String> {
		match self {
			CredentialDescriptor::Certificate { .. } => Vec::new(),
			CredentialDescriptor::Interactive { secret, .. } if !secret.is_empty() => vec![secret.expose().to_string()],
			CredentialDescriptor::Interactive { .. } => Vec::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_debug_is_redacted() {
		let descriptor = CredentialDescriptor::Interactive {
			username: "admin@contoso.com".into(),
			secret: Secret::new("hunter2"),
		};
		let rendered = format!("{descriptor:?}");
		assert!(!rendered.contains("hunter2"), "{rendered}");
		assert!(rendered.contains("admin@contoso.com"));
	}

	#[test]
	fn variant_follows_tag() {
		let cert = CredentialDescriptor::Certificate {
			application_id: "app".into(),
			certificate_thumbprint: "ABCDEF".into(),
			directory_id: "dir".into(),
		};
		assert_eq!(cert.variant(), CredentialVariant::Certificate);
		assert!(cert.secrets().is_empty());

		let interactive = CredentialDescriptor::Interactive {
			username: "u".into(),
			secret: Secret::new("p"),
		};
		assert_eq!(interactive.variant(), CredentialVariant::Interactive);
		assert_eq!(interactive.secrets(), vec!["p".to_string()]);
	}
}
