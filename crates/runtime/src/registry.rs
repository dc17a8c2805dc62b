//! The session-id to session map.
//!
//! All access goes through [`SessionRegistry`] methods; the map itself is
//! never handed out. `create` checks capacity, launches, and inserts under a
//! single lock so two concurrent creates cannot both take the last slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::credential::CredentialDescriptor;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::session::{Session, SessionConfig, SessionHandle, SessionId, SessionInfo};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub max_sessions: usize,
	pub session: SessionConfig,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			max_sessions: 32,
			session: SessionConfig::default(),
		}
	}
}

pub struct SessionRegistry {
	launcher: Arc<dyn Launcher>,
	config: RegistryConfig,
	sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
	pub fn new(launcher: Arc<dyn Launcher>, config: RegistryConfig) -> Self {
		Self {
			launcher,
			config,
			sessions: Mutex::new(HashMap::new()),
		}
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.config
	}

	/// Launches a shell for `tenant` and registers its session.
	///
	/// Must be called from within a tokio runtime.
	pub fn create(&self, operator: &str, tenant: &str, descriptor: &CredentialDescriptor) -> Result<SessionHandle> {
		let mut sessions = self.sessions.lock();

		let live = sessions.values().filter(|h| !h.is_finished()).count();
		if live >= self.config.max_sessions {
			return Err(Error::ResourceExhausted(format!(
				"session limit of {} reached",
				self.config.max_sessions
			)));
		}

		let shell = self.launcher.launch(descriptor, tenant)?;
		let info = SessionInfo {
			id: SessionId::new(),
			operator: operator.to_string(),
			tenant: tenant.to_string(),
			variant: descriptor.variant(),
			created_at: SystemTime::now(),
		};
		let handle = Session::start(info, descriptor, shell, self.config.session.clone());
		sessions.insert(handle.id(), handle.clone());

		info!(
			target = "tenantshell.registry",
			session = %handle.id(),
			operator,
			tenant,
			live = live + 1,
			"session created"
		);
		Ok(handle)
	}

	pub fn get(&self, id: &SessionId) -> Result<SessionHandle> {
		self.sessions.lock().get(id).cloned().ok_or(Error::NotFound(*id))
	}

	/// Removes the session and terminates its shell.
	///
	/// Returns `false` when the session was already gone.
	pub async fn destroy(&self, id: &SessionId, reason: &str) -> bool {
		self.destroy_with_error(id, reason, None).await
	}

	/// Like [`destroy`](Self::destroy), reporting `error` to the session's subscribers.
	pub async fn destroy_with_error(&self, id: &SessionId, reason: &str, error: Option<Error>) -> bool {
		let removed = self.sessions.lock().remove(id);
		match removed {
			Some(handle) => {
				handle.terminate(reason, error).await;
				info!(target = "tenantshell.registry", session = %id, reason, "session destroyed");
				true
			}
			None => {
				debug!(target = "tenantshell.registry", session = %id, "destroy of unknown session ignored");
				false
			}
		}
	}

	/// Handles of every registered session.
	pub fn handles(&self) -> Vec<SessionHandle> {
		self.sessions.lock().values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.lock().is_empty()
	}

	/// Destroys every session, e.g. on server shutdown.
	pub async fn shutdown_all(&self, reason: &str) {
		let drained: Vec<_> = self.sessions.lock().drain().map(|(_, handle)| handle).collect();
		for handle in &drained {
			handle.shutdown(reason).await;
		}
		if !drained.is_empty() {
			info!(target = "tenantshell.registry", count = drained.len(), reason, "all sessions destroyed");
		}
	}
}
