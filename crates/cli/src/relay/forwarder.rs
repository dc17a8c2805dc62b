use std::sync::Arc;

use tenantshell_protocol::{ServerMessage, SessionState};
use tenantshell_runtime::{SessionEvent, SessionHandle, SessionRegistry};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What the client was last told about the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notified {
	Nothing,
	AwaitingSecondFactor,
	Connected,
}

/// Relays one session's events to one connection until the session ends
/// or the task is aborted on detach.
pub(super) fn spawn(
	handle: SessionHandle,
	registry: Arc<SessionRegistry>,
	outbound: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
	// Subscribe before the snapshot so no transition falls in between.
	let events = handle.subscribe();
	let snapshot = handle.snapshot();
	tokio::spawn(async move {
		let mut forwarder = Forwarder {
			session_id: handle.id().to_string(),
			outbound,
			notified: Notified::Nothing,
		};
		if snapshot.state.is_terminated() {
			forwarder.send(ServerMessage::SessionClosed {
				session_id: forwarder.session_id.clone(),
				reason: "session already terminated".into(),
			});
			return;
		}
		forwarder.state(snapshot.state, snapshot.prompt);
		forwarder.run(events, &handle, &registry).await;
	})
}

struct Forwarder {
	session_id: String,
	outbound: mpsc::UnboundedSender<ServerMessage>,
	notified: Notified,
}

impl Forwarder {
	/// Returns `false` once the connection is gone.
	fn send(&self, message: ServerMessage) -> bool {
		self.outbound.send(message).is_ok()
	}

	fn state(&mut self, state: SessionState, prompt: Option<String>) -> bool {
		let next = match state {
			SessionState::AwaitingSecondFactor => Notified::AwaitingSecondFactor,
			s if s.is_connected() => Notified::Connected,
			_ => return true,
		};
		if next == self.notified {
			return true;
		}
		self.notified = next;
		let session_id = self.session_id.clone();
		self.send(match next {
			Notified::AwaitingSecondFactor => ServerMessage::AwaitingSecondFactor { session_id, prompt },
			_ => ServerMessage::Connected { session_id },
		})
	}

	async fn run(
		&mut self,
		mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
		handle: &SessionHandle,
		registry: &SessionRegistry,
	) {
		loop {
			let open = match events.recv().await {
				Ok(SessionEvent::StateChanged { state, prompt }) => self.state(state, prompt),
				Ok(SessionEvent::Output { text }) => self.send(ServerMessage::Output {
					session_id: self.session_id.clone(),
					text,
				}),
				Ok(SessionEvent::Terminated { reason, error }) => {
					if let Some(error) = error {
						self.send(ServerMessage::Error {
							session_id: Some(self.session_id.clone()),
							error,
						});
					}
					self.send(ServerMessage::SessionClosed {
						session_id: self.session_id.clone(),
						reason: reason.clone(),
					});
					registry.destroy(&handle.id(), &reason).await;
					return;
				}
				Err(RecvError::Lagged(skipped)) => {
					warn!(target = "tenantshell.relay", session = %self.session_id, skipped, "client fell behind; output dropped");
					let snapshot = handle.snapshot();
					self.state(snapshot.state, snapshot.prompt)
				}
				Err(RecvError::Closed) => {
					self.send(ServerMessage::SessionClosed {
						session_id: self.session_id.clone(),
						reason: "session ended".into(),
					});
					return;
				}
			};
			if !open {
				debug!(target = "tenantshell.relay", session = %self.session_id, "connection gone; forwarder stopping");
				return;
			}
		}
	}
}
