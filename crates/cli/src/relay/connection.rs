use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tenantshell_protocol::{AuditOutcome, AuditRecord, ClientMessage, ErrorBody, ErrorCode, Operation, ServerMessage};
use tenantshell_runtime::{OperationOutcome, SessionHandle, SessionId, execute};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{RelayState, forwarder};
use crate::error::{RelayError, Result};

const CLOSED_BY_CLIENT: &str = "closed by client";

pub(super) async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
	let (sender, mut receiver) = socket.split();
	let (outbound, rx) = mpsc::unbounded_channel();
	let writer = tokio::spawn(write_loop(sender, rx));

	let Some(operator) = handshake(&mut receiver, &outbound, &state).await else {
		drop(outbound);
		let _ = writer.await;
		return;
	};

	let mut connection = Connection {
		state,
		operator,
		outbound,
		attached: HashMap::new(),
	};
	connection.serve(&mut receiver).await;
	connection.detach_all();
}

async fn write_loop(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<ServerMessage>) {
	while let Some(message) = rx.recv().await {
		let json = serde_json::to_string(&message).expect("ServerMessage is always serializable");
		if sender.send(Message::Text(json.into())).await.is_err() {
			break;
		}
	}
	let _ = sender.close().await;
}

/// Reads the next client message. `None` once the socket is closed.
async fn next_message(receiver: &mut SplitStream<WebSocket>) -> Option<std::result::Result<ClientMessage, String>> {
	while let Some(frame) = receiver.next().await {
		match frame {
			Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).map_err(|e| format!("invalid message: {e}"))),
			Ok(Message::Binary(_)) => return Some(Err("binary frames are not supported".into())),
			Ok(Message::Close(_)) => return None,
			Ok(_) => continue,
			Err(e) => {
				debug!(target = "tenantshell.relay", error = %e, "websocket read failed");
				return None;
			}
		}
	}
	None
}

fn protocol_error(message: impl Into<String>) -> ServerMessage {
	ServerMessage::Error {
		session_id: None,
		error: ErrorBody::new(ErrorCode::ProtocolViolation, message),
	}
}

/// Waits for `hello`. Returns the authenticated operator.
async fn handshake(
	receiver: &mut SplitStream<WebSocket>,
	outbound: &mpsc::UnboundedSender<ServerMessage>,
	state: &RelayState,
) -> Option<String> {
	loop {
		match next_message(receiver).await? {
			Ok(ClientMessage::Hello { token }) => {
				return match state.tokens.validate(&token) {
					Some(operator) => {
						info!(target = "tenantshell.relay", operator = %operator, "client authenticated");
						let _ = outbound.send(ServerMessage::Welcome {
							operator: operator.clone(),
							version: env!("CARGO_PKG_VERSION").into(),
						});
						Some(operator)
					}
					None => {
						warn!(target = "tenantshell.relay", "client presented an invalid or expired token");
						let _ = outbound.send(ServerMessage::Rejected {
							reason: "invalid or expired token".into(),
						});
						None
					}
				};
			}
			Ok(other) => {
				let _ = outbound.send(protocol_error(format!("`{}` before hello", other.kind())));
			}
			Err(message) => {
				let _ = outbound.send(protocol_error(message));
			}
		}
	}
}

struct Connection {
	state: Arc<RelayState>,
	operator: String,
	outbound: mpsc::UnboundedSender<ServerMessage>,
	/// Forwarder task per attached session.
	attached: HashMap<SessionId, JoinHandle<()>>,
}

impl Connection {
	async fn serve(&mut self, receiver: &mut SplitStream<WebSocket>) {
		while let Some(message) = next_message(receiver).await {
			let message = match message {
				Ok(message) => message,
				Err(text) => {
					self.send(ServerMessage::Error {
						session_id: None,
						error: ErrorBody::new(ErrorCode::InvalidInput, text),
					});
					continue;
				}
			};
			let kind = message.kind();
			let session_id = message.session_id().map(str::to_string);
			debug!(target = "tenantshell.relay", operator = %self.operator, kind, "client message");

			if let Err(e) = self.dispatch(message).await {
				warn!(
					target = "tenantshell.relay",
					operator = %self.operator,
					kind,
					code = %e.code(),
					error = %e,
					"request rejected"
				);
				self.send(ServerMessage::Error {
					session_id,
					error: e.to_body(),
				});
			}
		}
		debug!(target = "tenantshell.relay", operator = %self.operator, "client disconnected");
	}

	async fn dispatch(&mut self, message: ClientMessage) -> Result<()> {
		match message {
			ClientMessage::Hello { .. } => Err(tenantshell_runtime::Error::ProtocolViolation("already authenticated".into()).into()),
			ClientMessage::CreateSession {
				credentials_ref,
				tenant_id,
			} => self.create_session(credentials_ref, tenant_id).await,
			ClientMessage::AttachSession { session_id } => {
				let handle = self.owned_session(&session_id)?;
				self.send(session_created(&handle));
				self.attach(handle);
				Ok(())
			}
			ClientMessage::SubmitSecondFactor { session_id, code } => {
				let handle = self.owned_session(&session_id)?;
				handle.submit_second_factor(code).await?;
				info!(target = "tenantshell.relay", operator = %self.operator, session = %handle.id(), "second factor forwarded");
				Ok(())
			}
			ClientMessage::RunOperation {
				session_id,
				operation,
				args,
			} => self.run_operation(&session_id, operation, args),
			ClientMessage::CloseSession { session_id } => {
				let handle = self.owned_session(&session_id)?;
				let id = handle.id();
				if let Some(forwarder) = self.attached.remove(&id) {
					forwarder.abort();
				}
				self.state.registry.destroy(&id, CLOSED_BY_CLIENT).await;
				self.send(ServerMessage::SessionClosed {
					session_id,
					reason: CLOSED_BY_CLIENT.into(),
				});
				Ok(())
			}
		}
	}

	async fn create_session(&mut self, credentials_ref: Option<String>, tenant: String) -> Result<()> {
		if tenant.trim().is_empty() {
			return Err(RelayError::InvalidInput("tenantId must not be empty".into()));
		}
		if !self.state.operators.may_access(&self.operator, &tenant) {
			return Err(RelayError::Forbidden {
				operator: self.operator.clone(),
				tenant,
			});
		}
		let credentials_ref = credentials_ref.unwrap_or_else(|| tenant.clone());
		let descriptor = self
			.state
			.credentials
			.get_credentials(&credentials_ref, &tenant)
			.await
			.inspect_err(|e| error!(target = "tenantshell.relay", tenant = %tenant, error = %e, "credential lookup failed"))?;

		let handle = self.state.registry.create(&self.operator, &tenant, &descriptor)?;
		self.send(session_created(&handle));
		self.attach(handle);
		Ok(())
	}

	fn run_operation(&mut self, session_id: &str, name: String, args: Value) -> Result<()> {
		let handle = self.owned_session(session_id)?;
		let op = match Operation::parse(&name, args) {
			Ok(op) => op,
			Err(message) => {
				self.send(ServerMessage::OperationResult {
					session_id: session_id.to_string(),
					operation: name,
					result: None,
					error: Some(ErrorBody::new(ErrorCode::InvalidInput, message)),
				});
				return Ok(());
			}
		};
		handle.touch();

		let audit = Arc::clone(&self.state.audit);
		let outbound = self.outbound.clone();
		let operator = self.operator.clone();
		tokio::spawn(async move {
			let outcome = execute(&handle, &op).await;
			let record = audit_record(&handle, &operator, &op, &outcome);
			let appended = audit.append(&record).await;

			let session_id = handle.id().to_string();
			let (result, error) = match outcome.result {
				Ok(value) => (Some(value), None),
				Err(e) => (None, Some(e.to_body())),
			};
			let _ = outbound.send(ServerMessage::OperationResult {
				session_id: session_id.clone(),
				operation: op.name().to_string(),
				result,
				error,
			});

			if let Err(e) = appended {
				error!(
					target = "tenantshell.audit",
					session = %session_id,
					operator = %operator,
					change_type = %record.change_type,
					error = %e,
					"audit record was not stored"
				);
				let _ = outbound.send(ServerMessage::Error {
					session_id: Some(session_id),
					error: e.to_body(),
				});
			}
		});
		Ok(())
	}

	/// Looks up a session the connected operator owns.
	fn owned_session(&self, session_id: &str) -> Result<SessionHandle> {
		let id: SessionId = session_id
			.parse()
			.map_err(|_| RelayError::InvalidInput(format!("`{session_id}` is not a session id")))?;
		let handle = self.state.registry.get(&id)?;
		if handle.info().operator != self.operator {
			return Err(RelayError::NotOwner(session_id.to_string()));
		}
		Ok(handle)
	}

	fn attach(&mut self, handle: SessionHandle) {
		let id = handle.id();
		if self.attached.get(&id).is_some_and(|task| !task.is_finished()) {
			return;
		}
		let task = forwarder::spawn(handle, Arc::clone(&self.state.registry), self.outbound.clone());
		self.attached.insert(id, task);
	}

	/// Unsubscribes from every session. The sessions keep running.
	fn detach_all(&mut self) {
		for (_, task) in self.attached.drain() {
			task.abort();
		}
	}

	fn send(&self, message: ServerMessage) {
		let _ = self.outbound.send(message);
	}
}

fn session_created(handle: &SessionHandle) -> ServerMessage {
	let info = handle.info();
	ServerMessage::SessionCreated {
		session_id: info.id.to_string(),
		tenant_id: info.tenant.clone(),
		variant: info.variant,
	}
}

fn audit_record(handle: &SessionHandle, operator: &str, op: &Operation, outcome: &OperationOutcome) -> AuditRecord {
	let at_ms = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0);
	AuditRecord {
		at_ms,
		operator: operator.to_string(),
		tenant: handle.info().tenant.clone(),
		session_id: handle.id().to_string(),
		target_identity: op.target_identity().map(str::to_string),
		change_type: op.name().to_string(),
		before_state: outcome.before.clone(),
		after_state: outcome.after.clone(),
		outcome: match &outcome.result {
			Ok(_) => AuditOutcome::Success,
			Err(e) => AuditOutcome::Failure {
				code: e.code().to_string(),
				message: e.to_string(),
			},
		},
	}
}
