//! Credential resolution for new sessions.
//!
//! The variant of each record is decided here, from its explicit `kind`
//! tag, and never re-derived later. Secret material is wrapped in
//! [`Secret`] as soon as it is read.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tenantshell_runtime::{CredentialDescriptor, Secret};

use crate::error::{RelayError, Result};

#[cfg(test)]
mod tests;

/// Looks up the credential descriptor for a session.
#[async_trait]
pub trait CredentialStore: Send + Sync {
	/// `credentials_ref` names a record; `tenant` is the directory the session targets.
	async fn get_credentials(&self, credentials_ref: &str, tenant: &str) -> Result<CredentialDescriptor>;
}

/// One record in the tenants file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase", deny_unknown_fields)]
pub enum CredentialRecord {
	Certificate {
		application_id: String,
		certificate_thumbprint: String,
		/// Defaults to the tenant the session targets.
		#[serde(default)]
		directory_id: Option<String>,
	},
	Interactive {
		username: String,
		#[serde(default)]
		password: Option<String>,
		/// Environment variable holding the password.
		#[serde(default)]
		password_env: Option<String>,
	},
}

impl CredentialRecord {
	fn into_descriptor(self, name: &str, tenant: &str) -> Result<CredentialDescriptor> {
		match self {
			CredentialRecord::Certificate {
				application_id,
				certificate_thumbprint,
				directory_id,
			} => Ok(CredentialDescriptor::Certificate {
				application_id,
				certificate_thumbprint,
				directory_id: directory_id.unwrap_or_else(|| tenant.to_string()),
			}),
			CredentialRecord::Interactive {
				username,
				password,
				password_env,
			} => {
				let secret = match (password, password_env) {
					(Some(password), _) => password,
					(None, Some(var)) => std::env::var(&var)
						.map_err(|_| RelayError::Credentials(format!("environment variable {var} for `{name}` is not set")))?,
					(None, None) => {
						return Err(RelayError::Credentials(format!(
							"interactive record `{name}` needs password or passwordEnv"
						)));
					}
				};
				if secret.is_empty() {
					return Err(RelayError::Credentials(format!("secret for `{name}` is empty")));
				}
				Ok(CredentialDescriptor::Interactive {
					username,
					secret: Secret::new(secret),
				})
			}
		}
	}
}

#[derive(Debug, Default, Deserialize)]
struct TenantsFile {
	#[serde(default)]
	tenants: HashMap<String, CredentialRecord>,
}

/// Reads the JSON tenants file on every lookup, so edits apply to the next session.
#[derive(Debug, Clone)]
pub struct JsonFileCredentialStore {
	path: PathBuf,
}

impl JsonFileCredentialStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	async fn read(&self) -> Result<TenantsFile> {
		let content = match tokio::fs::read_to_string(&self.path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TenantsFile::default()),
			Err(e) => return Err(RelayError::Credentials(format!("{}: {e}", self.path.display()))),
		};
		serde_json::from_str(&content).map_err(|e| RelayError::Credentials(format!("{}: {e}", self.path.display())))
	}

	/// Names of all configured records, for diagnostics.
	pub async fn names(&self) -> Result<Vec<String>> {
		let mut names: Vec<_> = self.read().await?.tenants.into_keys().collect();
		names.sort();
		Ok(names)
	}
}

#[async_trait]
impl CredentialStore for JsonFileCredentialStore {
	async fn get_credentials(&self, credentials_ref: &str, tenant: &str) -> Result<CredentialDescriptor> {
		let mut file = self.read().await?;
		let record = file
			.tenants
			.remove(credentials_ref)
			.ok_or_else(|| RelayError::UnknownTenant(credentials_ref.to_string()))?;
		record.into_descriptor(credentials_ref, tenant)
	}
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
	entries: RwLock<HashMap<String, CredentialDescriptor>>,
}

impl MemoryCredentialStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, credentials_ref: impl Into<String>, descriptor: CredentialDescriptor) {
		self.entries.write().insert(credentials_ref.into(), descriptor);
	}
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
	async fn get_credentials(&self, credentials_ref: &str, _tenant: &str) -> Result<CredentialDescriptor> {
		self.entries
			.read()
			.get(credentials_ref)
			.cloned()
			.ok_or_else(|| RelayError::UnknownTenant(credentials_ref.to_string()))
	}
}
