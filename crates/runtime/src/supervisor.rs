//! Periodic reclamation of expired sessions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tenantshell_protocol::SessionState;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, TimeoutKind};
use crate::process::pid_is_alive;
use crate::registry::SessionRegistry;
use crate::session::{SessionId, SessionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
	pub idle_timeout: Duration,
	/// Ceiling on how long a session may wait for a second factor.
	pub second_factor_timeout: Duration,
	pub sweep_interval: Duration,
}

impl Default for ExpiryPolicy {
	fn default() -> Self {
		Self {
			idle_timeout: Duration::from_secs(900),
			second_factor_timeout: Duration::from_secs(600),
			sweep_interval: Duration::from_secs(15),
		}
	}
}

/// Why a session was reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
	/// The session ended on its own (shell exit, auth failure) and is still registered.
	Terminated,
	SecondFactorTimeout,
	Idle,
}

impl ExpiryReason {
	pub fn describe(self) -> &'static str {
		match self {
			ExpiryReason::Terminated => "session ended",
			ExpiryReason::SecondFactorTimeout => "second factor was not provided in time",
			ExpiryReason::Idle => "session idle timeout",
		}
	}

	/// Error reported to clients, if the reason is a failure.
	pub fn error(self, policy: &ExpiryPolicy) -> Option<Error> {
		match self {
			ExpiryReason::SecondFactorTimeout => Some(Error::Timeout {
				what: TimeoutKind::SecondFactor,
				after: policy.second_factor_timeout,
			}),
			ExpiryReason::Terminated | ExpiryReason::Idle => None,
		}
	}
}

/// Decides whether a session should be reclaimed.
pub fn expiry_reason(snapshot: &SessionSnapshot, now: Instant, policy: &ExpiryPolicy) -> Option<ExpiryReason> {
	match snapshot.state {
		SessionState::Terminated => Some(ExpiryReason::Terminated),
		_ if snapshot.exited => Some(ExpiryReason::Terminated),
		SessionState::AwaitingSecondFactor => {
			(now.saturating_duration_since(snapshot.state_since) >= policy.second_factor_timeout).then_some(ExpiryReason::SecondFactorTimeout)
		}
		// A running command is bounded by its own deadline.
		SessionState::Executing => None,
		_ => (now.saturating_duration_since(snapshot.last_activity) >= policy.idle_timeout).then_some(ExpiryReason::Idle),
	}
}

/// Sweeps the registry on a fixed interval.
pub struct Supervisor {
	registry: Arc<SessionRegistry>,
	policy: ExpiryPolicy,
}

impl Supervisor {
	pub fn new(registry: Arc<SessionRegistry>, policy: ExpiryPolicy) -> Self {
		Self { registry, policy }
	}

	/// Destroys every expired session and returns what was reclaimed.
	pub async fn sweep(&self) -> Vec<(SessionId, ExpiryReason)> {
		let now = Instant::now();
		let expired: Vec<_> = self
			.registry
			.handles()
			.into_iter()
			.filter_map(|handle| expiry_reason(&handle.snapshot(), now, &self.policy).map(|reason| (handle, reason)))
			.collect();

		let mut reclaimed = Vec::with_capacity(expired.len());
		for (handle, reason) in expired {
			let id = handle.id();
			let destroyed = self.registry.destroy_with_error(&id, reason.describe(), reason.error(&self.policy)).await;
			if !destroyed {
				continue;
			}
			info!(target = "tenantshell.supervisor", session = %id, reason = reason.describe(), "session reclaimed");

			if let Some(pid) = handle.snapshot().pid {
				if pid_is_alive(pid) {
					warn!(target = "tenantshell.supervisor", session = %id, pid, "shell still alive after reclamation");
				}
			}
			reclaimed.push((id, reason));
		}
		reclaimed
	}

	/// Sweeps until `shutdown` resolves.
	pub async fn run(self, shutdown: impl Future<Output = ()>) {
		let mut ticker = tokio::time::interval(self.policy.sweep_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		tokio::pin!(shutdown);

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					let reclaimed = self.sweep().await;
					debug!(target = "tenantshell.supervisor", reclaimed = reclaimed.len(), live = self.registry.len(), "sweep complete");
				}
				_ = &mut shutdown => {
					debug!(target = "tenantshell.supervisor", "supervisor stopping");
					break;
				}
			}
		}
	}

	pub fn spawn(self, shutdown: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
		tokio::spawn(self.run(shutdown))
	}
}
