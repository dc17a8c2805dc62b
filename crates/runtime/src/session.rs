//! Per-session actor.
//!
//! A [`Session`] task exclusively owns one shell process, its dispatcher and
//! the parsers reading its stdout and stderr. Everything else talks to it
//! through a cloneable [`SessionHandle`]: requests go in over an mpsc
//! channel, events come out on a broadcast channel, and the latest
//! [`SessionSnapshot`] is published on a watch channel for the supervisor.

use std::collections::VecDeque;
use std::future::pending;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tenantshell_protocol::{CredentialVariant, ErrorBody, SessionState};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credential::CredentialDescriptor;
use crate::dispatcher::{Command, Dispatcher};
use crate::error::{Error, Result, TimeoutKind};
use crate::launcher::LaunchedShell;
use crate::parser::{OutputEvent, OutputParser, RuleSet};
use crate::process::ProcessControl;

const READ_CHUNK: usize = 8 * 1024;
const EVENT_CAPACITY: usize = 256;
const REQUEST_CAPACITY: usize = 64;
const REDACTED: &str = "***";

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

impl FromStr for SessionId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Uuid::parse_str(s).map(Self)
	}
}

/// Immutable facts about a session, fixed at creation.
#[derive(Debug, Clone)]
pub struct SessionInfo {
	pub id: SessionId,
	pub operator: String,
	pub tenant: String,
	pub variant: CredentialVariant,
	pub created_at: SystemTime,
}

/// Tunables applied to each session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	pub command_timeout: Duration,
	/// Bound on reaching `Connected` while in `Connecting`.
	pub connect_timeout: Duration,
	pub rules: RuleSet,
	/// Raw lines kept for authentication failure diagnostics.
	pub output_tail: usize,
	/// How long output is still read after the shell exits.
	pub drain_grace: Duration,
	/// How long shutdown waits for the killed shell to be reaped.
	pub kill_grace: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			command_timeout: Duration::from_secs(60),
			connect_timeout: Duration::from_secs(120),
			rules: RuleSet::standard(),
			output_tail: 40,
			drain_grace: Duration::from_millis(500),
			kill_grace: Duration::from_secs(5),
		}
	}
}

/// Point-in-time view of a session published after every change.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
	pub state: SessionState,
	/// Set once a command timed out; the session stays usable.
	pub degraded: bool,
	pub pid: Option<u32>,
	/// Whether the shell process has exited.
	pub exited: bool,
	pub last_activity: Instant,
	pub state_since: Instant,
	/// Most recent second-factor prompt text.
	pub prompt: Option<String>,
}

/// Events broadcast to every subscriber of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	StateChanged { state: SessionState, prompt: Option<String> },
	/// Redacted raw output line.
	Output { text: String },
	/// Last event of a session. `error` is set when the session failed.
	Terminated { reason: String, error: Option<ErrorBody> },
}

enum Request {
	Run {
		command: Command,
		reply: oneshot::Sender<Result<Value>>,
	},
	SecondFactor {
		code: String,
		reply: oneshot::Sender<Result<()>>,
	},
	Touch,
	Shutdown {
		reason: String,
		error: Option<Error>,
		done: oneshot::Sender<()>,
	},
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
	info: Arc<SessionInfo>,
	requests: mpsc::Sender<Request>,
	events: broadcast::Sender<SessionEvent>,
	snapshot: watch::Receiver<SessionSnapshot>,
	operations: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SessionHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionHandle")
			.field("id", &self.info.id)
			.field("tenant", &self.info.tenant)
			.field("state", &self.state())
			.finish()
	}
}

impl SessionHandle {
	pub fn id(&self) -> SessionId {
		self.info.id
	}

	pub fn info(&self) -> &SessionInfo {
		&self.info
	}

	pub fn state(&self) -> SessionState {
		self.snapshot.borrow().state
	}

	pub fn snapshot(&self) -> SessionSnapshot {
		self.snapshot.borrow().clone()
	}

	/// Receiver that observes every snapshot change.
	pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
		self.snapshot.clone()
	}

	/// Subscribes to events published from now on.
	///
	/// Subscribe before reading [`snapshot`](Self::snapshot) so no transition is missed.
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	/// Queues `command` behind any earlier ones and waits for its result.
	///
	/// Rejected with `ProtocolViolation` unless the session is connected.
	pub async fn run(&self, command: Command) -> Result<Value> {
		let (reply, rx) = oneshot::channel();
		self.send(Request::Run { command, reply }).await?;
		rx.await.map_err(|_| self.closed())?
	}

	/// Holds the session for a multi-command operation.
	///
	/// Commands from other holders wait until the guard drops; plain
	/// [`run`](Self::run) calls do not take it.
	pub async fn exclusive(&self) -> OwnedMutexGuard<()> {
		Arc::clone(&self.operations).lock_owned().await
	}

	/// Forwards a second-factor code to the shell.
	pub async fn submit_second_factor(&self, code: impl Into<String>) -> Result<()> {
		let (reply, rx) = oneshot::channel();
		self.send(Request::SecondFactor { code: code.into(), reply }).await?;
		rx.await.map_err(|_| self.closed())?
	}

	/// Records client activity without running anything.
	pub fn touch(&self) {
		let _ = self.requests.try_send(Request::Touch);
	}

	/// Terminates the shell and waits until it has been reaped.
	///
	/// Idempotent: returns immediately when the session already ended.
	pub async fn shutdown(&self, reason: impl Into<String>) {
		self.terminate(reason, None).await;
	}

	/// Like [`shutdown`](Self::shutdown), but reports `error` to subscribers
	/// in the `Terminated` event.
	pub async fn terminate(&self, reason: impl Into<String>, error: Option<Error>) {
		let (done, rx) = oneshot::channel();
		let request = Request::Shutdown {
			reason: reason.into(),
			error,
			done,
		};
		if self.requests.send(request).await.is_ok() {
			let _ = rx.await;
		}
	}

	/// Whether the session task has ended.
	pub fn is_finished(&self) -> bool {
		self.requests.is_closed()
	}

	async fn send(&self, request: Request) -> Result<()> {
		self.requests.send(request).await.map_err(|_| self.closed())
	}

	fn closed(&self) -> Error {
		Error::SessionClosed(format!("session {} has terminated", self.info.id))
	}
}

/// Starts session tasks.
pub struct Session;

impl Session {
	/// Spawns the actor for a freshly launched shell and queues its bootstrap script.
	///
	/// Must be called from within a tokio runtime.
	pub fn start(info: SessionInfo, descriptor: &CredentialDescriptor, shell: LaunchedShell, config: SessionConfig) -> SessionHandle {
		let LaunchedShell { process, bootstrap } = shell;
		let info = Arc::new(info);
		let now = Instant::now();
		let pid = process.control.id();

		let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
		let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
		let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
			state: SessionState::Created,
			degraded: false,
			pid,
			exited: false,
			last_activity: now,
			state_since: now,
			prompt: None,
		});

		let mut dispatcher = Dispatcher::new(process.stdin, config.command_timeout);
		dispatcher.enqueue(Command::fire_and_forget(bootstrap), None);

		let actor = SessionActor {
			info: Arc::clone(&info),
			variant: descriptor.variant(),
			redactions: descriptor.secrets(),
			stdout_parser: OutputParser::new(config.rules.clone()),
			stderr_parser: OutputParser::new(config.rules.clone()),
			config,
			control: process.control,
			stdout: Some(process.stdout),
			stderr: Some(process.stderr),
			dispatcher,
			requests: requests_rx,
			events: events_tx.clone(),
			snapshot: snapshot_tx,
			state: SessionState::Created,
			second_factor_rounds: 0,
			connect_deadline: None,
			tail: VecDeque::new(),
			exit: None,
			finished: None,
			shutdown_waiters: Vec::new(),
		};
		tokio::spawn(actor.run());

		SessionHandle {
			info,
			requests: requests_tx,
			events: events_tx,
			snapshot: snapshot_rx,
			operations: Arc::new(Mutex::new(())),
		}
	}
}

enum Wake {
	Stdout(std::io::Result<usize>),
	Stderr(std::io::Result<usize>),
	Request(Option<Request>),
	Exited(std::io::Result<Option<i32>>),
	CommandDeadline,
	ConnectDeadline,
}

#[derive(Clone, Copy)]
enum Stream {
	Stdout,
	Stderr,
}

struct SessionActor {
	info: Arc<SessionInfo>,
	variant: CredentialVariant,
	redactions: Vec<String>,
	config: SessionConfig,
	control: Box<dyn ProcessControl>,
	stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
	stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
	stdout_parser: OutputParser,
	stderr_parser: OutputParser,
	dispatcher: Dispatcher,
	requests: mpsc::Receiver<Request>,
	events: broadcast::Sender<SessionEvent>,
	snapshot: watch::Sender<SessionSnapshot>,
	state: SessionState,
	second_factor_rounds: u32,
	connect_deadline: Option<Instant>,
	tail: VecDeque<String>,
	exit: Option<Option<i32>>,
	/// Set when the session has decided to terminate.
	finished: Option<(String, Option<Error>)>,
	shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl SessionActor {
	async fn run(mut self) {
		info!(
			target = "tenantshell.session",
			session = %self.info.id,
			tenant = %self.info.tenant,
			variant = %self.variant,
			"session starting"
		);
		self.transition(SessionState::Connecting, None);
		self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
		self.pump().await;

		let mut out_buf = vec![0u8; READ_CHUNK];
		let mut err_buf = vec![0u8; READ_CHUNK];

		while self.finished.is_none() {
			let command_deadline = self.dispatcher.deadline();
			let connect_deadline = self.connect_deadline;
			let waiting_exit = self.exit.is_none();

			let wake = tokio::select! {
				result = read_some(&mut self.stdout, &mut out_buf) => Wake::Stdout(result),
				result = read_some(&mut self.stderr, &mut err_buf) => Wake::Stderr(result),
				request = self.requests.recv() => Wake::Request(request),
				status = self.control.wait(), if waiting_exit => Wake::Exited(status),
				_ = sleep_until(command_deadline) => Wake::CommandDeadline,
				_ = sleep_until(connect_deadline) => Wake::ConnectDeadline,
			};

			match wake {
				Wake::Stdout(result) => self.on_read(Stream::Stdout, result, &out_buf).await,
				Wake::Stderr(result) => self.on_read(Stream::Stderr, result, &err_buf).await,
				Wake::Request(Some(request)) => self.on_request(request).await,
				Wake::Request(None) => self.finish("all session handles dropped".to_string(), None),
				Wake::Exited(status) => self.on_exit(status, &mut out_buf, &mut err_buf).await,
				Wake::CommandDeadline => {
					if self.dispatcher.expire(&mut self.stdout_parser) {
						self.snapshot.send_modify(|s| s.degraded = true);
						warn!(target = "tenantshell.session", session = %self.info.id, "session degraded after command timeout");
						self.sync_busy_state();
						self.pump().await;
					}
				}
				Wake::ConnectDeadline => {
					self.connect_deadline = None;
					if self.state == SessionState::Connecting {
						self.finish(
							"authentication did not complete in time".to_string(),
							Some(Error::Timeout {
								what: TimeoutKind::Authentication,
								after: self.config.connect_timeout,
							}),
						);
					}
				}
			}
		}

		self.teardown().await;
	}

	async fn on_read(&mut self, stream: Stream, result: std::io::Result<usize>, buf: &[u8]) {
		let n = match result {
			Ok(n) => n,
			Err(e) => {
				debug!(target = "tenantshell.session", session = %self.info.id, error = %e, "shell output read failed");
				0
			}
		};

		if n == 0 {
			match stream {
				Stream::Stdout => self.stdout = None,
				Stream::Stderr => self.stderr = None,
			}
			self.parser(stream).finish();
		} else {
			self.parser(stream).feed(&buf[..n]);
		}
		self.process_events(stream).await;
	}

	fn parser(&mut self, stream: Stream) -> &mut OutputParser {
		match stream {
			Stream::Stdout => &mut self.stdout_parser,
			Stream::Stderr => &mut self.stderr_parser,
		}
	}

	async fn process_events(&mut self, stream: Stream) {
		while self.finished.is_none() {
			let Some(event) = self.parser(stream).next_event() else {
				break;
			};
			self.on_event(event).await;
		}
	}

	async fn on_event(&mut self, event: OutputEvent) {
		match event {
			OutputEvent::Raw(line) => self.forward_output(&line),
			OutputEvent::SecondFactorPrompt(prompt) => {
				self.forward_output(&prompt);
				self.on_second_factor_prompt(prompt);
			}
			OutputEvent::Connected => self.on_connected(),
			OutputEvent::AuthRejected(message) if !self.state.is_connected() => {
				let message = self.redact(&message);
				let output_tail = self.tail.iter().cloned().collect();
				self.finish(format!("authentication rejected: {message}"), Some(Error::AuthFailure { message, output_tail }));
			}
			OutputEvent::AuthRejected(message) => self.forward_output(&message),
			OutputEvent::BlockStart | OutputEvent::BlockLine(_) => {}
			event @ (OutputEvent::BlockEnd(_) | OutputEvent::CommandFailed(_)) => {
				if self.dispatcher.resolve(&event) {
					self.touch();
					self.sync_busy_state();
					self.pump().await;
				}
			}
		}
	}

	fn on_second_factor_prompt(&mut self, prompt: String) {
		match (self.variant, self.state) {
			(CredentialVariant::Certificate, state) if !state.is_connected() => {
				let output_tail = self.tail.iter().cloned().collect();
				self.finish(
					"certificate authentication asked for a second factor".to_string(),
					Some(Error::AuthFailure {
						message: format!("unexpected second-factor prompt: {prompt}"),
						output_tail,
					}),
				);
			}
			(CredentialVariant::Interactive, SessionState::Connecting) if self.second_factor_rounds > 0 => {
				let output_tail = self.tail.iter().cloned().collect();
				self.finish(
					"second factor was not accepted".to_string(),
					Some(Error::AuthFailure {
						message: format!("second factor requested again: {prompt}"),
						output_tail,
					}),
				);
			}
			(CredentialVariant::Interactive, SessionState::Connecting) => {
				self.connect_deadline = None;
				info!(target = "tenantshell.session", session = %self.info.id, "awaiting second factor");
				self.transition(SessionState::AwaitingSecondFactor, Some(prompt));
			}
			(_, state) => {
				debug!(target = "tenantshell.session", session = %self.info.id, %state, "ignoring second-factor prompt");
			}
		}
	}

	fn on_connected(&mut self) {
		match self.state {
			SessionState::Connecting if self.variant == CredentialVariant::Interactive && self.second_factor_rounds == 0 => {
				let output_tail = self.tail.iter().cloned().collect();
				self.finish(
					"interactive sign-in skipped the second factor".to_string(),
					Some(Error::AuthFailure {
						message: "connected without a second-factor round".to_string(),
						output_tail,
					}),
				);
			}
			SessionState::Connecting => {
				self.connect_deadline = None;
				info!(target = "tenantshell.session", session = %self.info.id, "connected");
				self.transition(SessionState::Connected, None);
			}
			SessionState::AwaitingSecondFactor => {
				info!(target = "tenantshell.session", session = %self.info.id, "sign-in approved out of band");
				self.second_factor_rounds += 1;
				self.transition(SessionState::Connecting, None);
				self.transition(SessionState::Connected, None);
			}
			_ => {}
		}
	}

	async fn on_request(&mut self, request: Request) {
		match request {
			Request::Run { command, reply } => {
				if !self.state.is_connected() {
					let _ = reply.send(Err(Error::ProtocolViolation(format!(
						"session is {}; operations require a connected session",
						self.state
					))));
					return;
				}
				self.touch();
				self.dispatcher.enqueue(command, Some(reply));
				self.pump().await;
			}
			Request::SecondFactor { code, reply } => {
				if self.state != SessionState::AwaitingSecondFactor {
					let _ = reply.send(Err(Error::ProtocolViolation(format!(
						"session is {}, not awaiting a second factor",
						self.state
					))));
					return;
				}
				self.touch();

				let code = code.trim().to_string();
				if !code.is_empty() && !self.redactions.contains(&code) {
					self.redactions.push(code.clone());
				}
				self.stdout_parser.note_written(&code);
				self.stderr_parser.note_written(&code);

				match self.dispatcher.write_raw(&code).await {
					Ok(()) => {
						self.second_factor_rounds += 1;
						info!(target = "tenantshell.session", session = %self.info.id, "second factor submitted");
						self.transition(SessionState::Connecting, None);
						self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
						let _ = reply.send(Ok(()));
					}
					Err(e) => {
						let _ = reply.send(Err(Error::SessionClosed("shell input closed".to_string())));
						self.finish("shell input closed".to_string(), Some(Error::Io(e)));
					}
				}
			}
			Request::Touch => self.touch(),
			Request::Shutdown { reason, error, done } => {
				self.shutdown_waiters.push(done);
				self.finish(reason, error);
			}
		}
	}

	async fn on_exit(&mut self, status: std::io::Result<Option<i32>>, out_buf: &mut [u8], err_buf: &mut [u8]) {
		let code = status.unwrap_or(None);
		self.exit = Some(code);
		self.snapshot.send_modify(|s| {
			s.exited = true;
			s.pid = None;
		});
		debug!(target = "tenantshell.session", session = %self.info.id, ?code, "shell exited");

		// Output written just before exit may still be in the pipes.
		let grace = Instant::now() + self.config.drain_grace;
		while (self.stdout.is_some() || self.stderr.is_some()) && self.finished.is_none() {
			let wake = tokio::select! {
				result = read_some(&mut self.stdout, out_buf) => Some((Stream::Stdout, result)),
				result = read_some(&mut self.stderr, err_buf) => Some((Stream::Stderr, result)),
				_ = tokio::time::sleep_until(grace) => None,
			};
			match wake {
				Some((Stream::Stdout, result)) => self.on_read(Stream::Stdout, result, out_buf).await,
				Some((Stream::Stderr, result)) => self.on_read(Stream::Stderr, result, err_buf).await,
				None => break,
			}
		}
		for stream in [Stream::Stdout, Stream::Stderr] {
			self.parser(stream).finish();
			self.process_events(stream).await;
		}

		if self.finished.is_some() {
			return;
		}
		let described = match code {
			Some(code) => format!("shell exited with code {code}"),
			None => "shell was terminated".to_string(),
		};
		if self.state.is_connected() {
			self.finish(described.clone(), Some(Error::SessionClosed(described)));
		} else {
			let output_tail = self.tail.iter().cloned().collect();
			self.finish(
				format!("{described} before connecting"),
				Some(Error::AuthFailure {
					message: format!("{described} before connecting"),
					output_tail,
				}),
			);
		}
	}

	async fn pump(&mut self) {
		if let Err(e) = self.dispatcher.pump(&mut self.stdout_parser).await {
			self.finish("shell input closed".to_string(), Some(e));
			return;
		}
		self.sync_busy_state();
	}

	/// Moves between `Connected` and `Executing` as commands start and finish.
	fn sync_busy_state(&mut self) {
		match (self.state, self.dispatcher.is_busy()) {
			(SessionState::Connected, true) => self.transition(SessionState::Executing, None),
			(SessionState::Executing, false) => self.transition(SessionState::Connected, None),
			_ => {}
		}
	}

	fn transition(&mut self, next: SessionState, prompt: Option<String>) {
		if !self.state.can_transition_to(next) {
			warn!(
				target = "tenantshell.session",
				session = %self.info.id,
				from = %self.state,
				to = %next,
				"ignoring illegal state transition"
			);
			return;
		}
		debug!(target = "tenantshell.session", session = %self.info.id, from = %self.state, to = %next, "state change");
		self.state = next;
		let now = Instant::now();
		self.snapshot.send_modify(|s| {
			s.state = next;
			s.state_since = now;
			if prompt.is_some() {
				s.prompt = prompt.clone();
			}
		});
		let _ = self.events.send(SessionEvent::StateChanged { state: next, prompt });
	}

	fn touch(&mut self) {
		let now = Instant::now();
		self.snapshot.send_modify(|s| s.last_activity = now);
	}

	fn forward_output(&mut self, line: &str) {
		let text = self.redact(line);
		if self.tail.len() == self.config.output_tail {
			self.tail.pop_front();
		}
		if self.config.output_tail > 0 {
			self.tail.push_back(text.clone());
		}
		let _ = self.events.send(SessionEvent::Output { text });
	}

	fn redact(&self, text: &str) -> String {
		self.redactions
			.iter()
			.filter(|secret| !secret.is_empty())
			.fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
	}

	fn finish(&mut self, reason: String, error: Option<Error>) {
		if self.finished.is_none() {
			self.finished = Some((reason, error));
		}
	}

	async fn teardown(mut self) {
		let (reason, error) = self.finished.take().unwrap_or_else(|| ("session ended".to_string(), None));

		let closed_reason = reason.clone();
		self.dispatcher.reject_all(|| Error::SessionClosed(closed_reason.clone()));

		if self.exit.is_none() {
			if let Err(e) = self.control.start_kill() {
				warn!(target = "tenantshell.session", session = %self.info.id, error = %e, "failed to kill shell");
			}
			match tokio::time::timeout(self.config.kill_grace, self.control.wait()).await {
				Ok(status) => self.exit = Some(status.unwrap_or(None)),
				Err(_) => warn!(target = "tenantshell.session", session = %self.info.id, "shell did not exit after kill"),
			}
		}

		match &error {
			Some(err) => warn!(
				target = "tenantshell.session",
				session = %self.info.id,
				code = %err.code(),
				reason = %reason,
				"session terminated with error"
			),
			None => info!(target = "tenantshell.session", session = %self.info.id, reason = %reason, "session terminated"),
		}

		self.transition(SessionState::Terminated, None);
		let reaped = self.exit.is_some();
		self.snapshot.send_modify(|s| {
			if reaped {
				s.pid = None;
			}
			s.exited = reaped;
		});
		let _ = self.events.send(SessionEvent::Terminated {
			reason,
			error: error.map(|e| e.to_body()),
		});

		// Requests that raced with termination.
		self.requests.close();
		while let Ok(request) = self.requests.try_recv() {
			match request {
				Request::Run { reply, .. } => {
					let _ = reply.send(Err(Error::SessionClosed("session terminated".to_string())));
				}
				Request::SecondFactor { reply, .. } => {
					let _ = reply.send(Err(Error::SessionClosed("session terminated".to_string())));
				}
				Request::Shutdown { done, .. } => self.shutdown_waiters.push(done),
				Request::Touch => {}
			}
		}
		for done in self.shutdown_waiters.drain(..) {
			let _ = done.send(());
		}
	}
}

async fn read_some(reader: &mut Option<Box<dyn AsyncRead + Send + Unpin>>, buf: &mut [u8]) -> std::io::Result<usize> {
	match reader.as_mut() {
		Some(reader) => reader.read(buf).await,
		None => pending().await,
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => pending().await,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::credential::Secret;
	use crate::launcher::ShellConfig;
	use crate::operations::structured;
	use crate::process::fake::{FakeProcessBuilder, FakeProcessController};

	fn certificate() -> CredentialDescriptor {
		CredentialDescriptor::Certificate {
			application_id: "app".into(),
			certificate_thumbprint: "THUMB".into(),
			directory_id: "contoso.onmicrosoft.com".into(),
		}
	}

	fn interactive() -> CredentialDescriptor {
		CredentialDescriptor::Interactive {
			username: "admin@contoso.com".into(),
			secret: Secret::new("hunter2"),
		}
	}

	fn start(descriptor: CredentialDescriptor, config: SessionConfig) -> (SessionHandle, FakeProcessController) {
		let (process, controller) = FakeProcessBuilder::new().build();
		let info = SessionInfo {
			id: SessionId::new(),
			operator: "alice".into(),
			tenant: "contoso".into(),
			variant: descriptor.variant(),
			created_at: SystemTime::now(),
		};
		let shell = LaunchedShell {
			bootstrap: ShellConfig::default().bootstrap_script(&descriptor, "contoso"),
			process,
		};
		(Session::start(info, &descriptor, shell, config), controller)
	}

	async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
		let mut rx = handle.watch();
		tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
			.await
			.expect("state not reached in time")
			.expect("session dropped");
	}

	async fn connect(handle: &SessionHandle, shell: &mut FakeProcessController) {
		let bootstrap = shell.read_stdin_line().await.unwrap();
		assert!(bootstrap.contains("Connect-MicrosoftTeams"));
		shell.write_stdout("TS:CONNECTED\n").await;
		wait_for_state(handle, SessionState::Connected).await;
	}

	/// Plays the shell for one structured command, replying with `body`.
	async fn answer(shell: &mut FakeProcessController, body: &str) -> String {
		let line = shell.read_stdin_line().await.unwrap();
		let tag = line
			.split("<<<TS:BEGIN:")
			.nth(1)
			.and_then(|rest| rest.split(">>>").next())
			.unwrap()
			.to_string();
		shell.write_stdout(&format!("<<<TS:BEGIN:{tag}>>>\n{body}\n<<<TS:END:{tag}>>>\n")).await;
		line
	}

	#[tokio::test]
	async fn certificate_session_connects_without_second_factor() {
		let (handle, mut shell) = start(certificate(), SessionConfig::default());
		let mut events = handle.subscribe();
		connect(&handle, &mut shell).await;

		let mut states = Vec::new();
		while let Ok(event) = events.try_recv() {
			if let SessionEvent::StateChanged { state, .. } = event {
				states.push(state);
			}
		}
		assert!(!states.contains(&SessionState::AwaitingSecondFactor), "{states:?}");
		assert_eq!(states.last(), Some(&SessionState::Connected));
	}

	#[tokio::test]
	async fn interactive_session_requires_one_second_factor_round() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let bootstrap = shell.read_stdin_line().await.unwrap();
		assert!(!bootstrap.contains("hunter2"));

		let err = handle.run(structured("Get-CsOnlineUser")).await.unwrap_err();
		assert!(matches!(err, Error::ProtocolViolation(_)));

		shell.write_stdout("Enter the verification code sent to +1 *** *** **55\n").await;
		wait_for_state(&handle, SessionState::AwaitingSecondFactor).await;
		assert!(handle.snapshot().prompt.unwrap().contains("verification code"));

		handle.submit_second_factor("123456").await.unwrap();
		assert_eq!(shell.read_stdin_line().await.as_deref(), Some("123456"));
		assert_eq!(handle.state(), SessionState::Connecting);

		let err = handle.submit_second_factor("654321").await.unwrap_err();
		assert!(matches!(err, Error::ProtocolViolation(_)));

		shell.write_stdout("TS:CONNECTED\n").await;
		wait_for_state(&handle, SessionState::Connected).await;
	}

	async fn terminal_error(events: &mut broadcast::Receiver<SessionEvent>) -> Option<ErrorBody> {
		loop {
			match events.recv().await.unwrap() {
				SessionEvent::Terminated { error, .. } => return error,
				_ => continue,
			}
		}
	}

	#[tokio::test]
	async fn interactive_connect_without_second_factor_is_auth_failure() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("TS:CONNECTED\n").await;

		let error = terminal_error(&mut events).await.unwrap();
		assert_eq!(error.code, tenantshell_protocol::ErrorCode::AuthFailure);
		assert!(error.message.contains("second-factor round"), "{}", error.message);
		assert!(handle.state().is_terminated());
		assert!(shell.was_killed());
	}

	#[tokio::test]
	async fn repeated_second_factor_prompt_is_auth_failure() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("Enter the verification code\n").await;
		wait_for_state(&handle, SessionState::AwaitingSecondFactor).await;
		handle.submit_second_factor("111111").await.unwrap();
		let _ = shell.read_stdin_line().await;

		shell.write_stdout("Code incorrect. Enter the verification code\n").await;
		let error = terminal_error(&mut events).await.unwrap();
		assert_eq!(error.code, tenantshell_protocol::ErrorCode::AuthFailure);
		assert_eq!(error.retry_hint.as_deref(), Some("start a new session"));
		assert!(!error.message.contains("111111"), "{}", error.message);
		assert!(handle.state().is_terminated());
	}

	#[tokio::test]
	async fn out_of_band_approval_completes_the_round() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("Approve the sign-in request in your authenticator app or enter the verification code\n").await;
		wait_for_state(&handle, SessionState::AwaitingSecondFactor).await;

		shell.write_stdout("TS:CONNECTED\n").await;
		wait_for_state(&handle, SessionState::Connected).await;
		assert!(!handle.is_finished());
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_requests_leave_activity_unchanged() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let _ = shell.read_stdin_line().await;
		wait_for_state(&handle, SessionState::Connecting).await;
		let before = handle.snapshot().last_activity;

		tokio::time::advance(Duration::from_secs(10)).await;
		assert!(matches!(handle.submit_second_factor("123456").await, Err(Error::ProtocolViolation(_))));
		assert!(matches!(handle.run(structured("Get-CsOnlineUser")).await, Err(Error::ProtocolViolation(_))));
		assert_eq!(handle.snapshot().last_activity, before);

		shell.write_stdout("Enter the verification code\n").await;
		wait_for_state(&handle, SessionState::AwaitingSecondFactor).await;
		handle.submit_second_factor("123456").await.unwrap();
		assert!(handle.snapshot().last_activity > before);
	}

	#[tokio::test]
	async fn terminate_reports_error_to_subscribers() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;

		let timeout = Error::Timeout {
			what: TimeoutKind::SecondFactor,
			after: Duration::from_secs(300),
		};
		handle.terminate("second factor not supplied in time", Some(timeout)).await;

		let error = terminal_error(&mut events).await.unwrap();
		assert_eq!(error.code, tenantshell_protocol::ErrorCode::Timeout);
		assert_eq!(error.retry_hint.as_deref(), Some("start a new session"));
		assert!(shell.was_killed());
	}

	#[tokio::test]
	async fn certificate_prompt_is_auth_failure() {
		let (handle, mut shell) = start(certificate(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("Enter the security code\n").await;
		wait_for_state(&handle, SessionState::Terminated).await;

		let mut terminal = None;
		while let Ok(event) = events.recv().await {
			if let SessionEvent::Terminated { error, .. } = event {
				terminal = error;
				break;
			}
		}
		assert_eq!(terminal.unwrap().code, tenantshell_protocol::ErrorCode::AuthFailure);
		assert!(shell.was_killed());
	}

	#[tokio::test]
	async fn auth_rejection_terminates_with_retry_hint() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("TS:AUTH-FAILED AADSTS50126: Invalid username or password (hunter2).\n").await;

		let error = loop {
			match events.recv().await.unwrap() {
				SessionEvent::Terminated { error, .. } => break error.unwrap(),
				_ => continue,
			}
		};
		assert_eq!(error.retry_hint.as_deref(), Some("start a new session"));
		assert!(error.message.contains("AADSTS50126"));
		assert!(!error.message.contains("hunter2"), "{}", error.message);
		assert!(handle.snapshot().state.is_terminated());
	}

	#[tokio::test]
	async fn exit_before_connecting_is_auth_failure() {
		let (handle, mut shell) = start(certificate(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("Import-Module: The specified module 'MicrosoftTeams' was not loaded\n").await;
		shell.exit(1);

		let error = loop {
			match events.recv().await.unwrap() {
				SessionEvent::Terminated { error, .. } => break error.unwrap(),
				_ => continue,
			}
		};
		assert_eq!(error.code, tenantshell_protocol::ErrorCode::AuthFailure);
		assert!(error.message.contains("code 1"), "{}", error.message);
		assert!(!shell.was_killed());
	}

	#[tokio::test]
	async fn malformed_result_keeps_session_connected() {
		let (handle, mut shell) = start(certificate(), SessionConfig::default());
		connect(&handle, &mut shell).await;

		let bad = tokio::spawn({
			let handle = handle.clone();
			async move { handle.run(structured("Get-CsOnlineUser -Identity 'bob'")).await }
		});
		answer(&mut shell, "{\"Identity\": oops").await;
		let err = bad.await.unwrap().unwrap_err();
		assert!(matches!(err, Error::MalformedResult { .. }));
		wait_for_state(&handle, SessionState::Connected).await;

		let good = tokio::spawn({
			let handle = handle.clone();
			async move { handle.run(structured("Get-CsOnlineUser -Identity 'bob'")).await }
		});
		answer(&mut shell, "{\"Identity\": \"bob\"}").await;
		assert_eq!(good.await.unwrap().unwrap(), json!({"Identity": "bob"}));
		assert_eq!(handle.state(), SessionState::Connected);
	}

	#[tokio::test(start_paused = true)]
	async fn command_timeout_degrades_session() {
		let config = SessionConfig {
			command_timeout: Duration::from_secs(30),
			..SessionConfig::default()
		};
		let (handle, mut shell) = start(certificate(), config);
		connect(&handle, &mut shell).await;

		let slow = tokio::spawn({
			let handle = handle.clone();
			async move { handle.run(structured("Get-CsOnlineUser")).await }
		});
		let _ = shell.read_stdin_line().await;
		let err = slow.await.unwrap().unwrap_err();
		assert!(matches!(err, Error::Timeout { what: TimeoutKind::Command, .. }));

		wait_for_state(&handle, SessionState::Connected).await;
		assert!(handle.snapshot().degraded);
		assert!(!handle.is_finished());
	}

	#[tokio::test(start_paused = true)]
	async fn connect_timeout_is_terminal() {
		let config = SessionConfig {
			connect_timeout: Duration::from_secs(10),
			..SessionConfig::default()
		};
		let (handle, mut shell) = start(certificate(), config);
		let _ = shell.read_stdin_line().await;
		wait_for_state(&handle, SessionState::Terminated).await;
		assert!(shell.was_killed());
	}

	#[tokio::test]
	async fn second_factor_code_is_redacted_from_output() {
		let (handle, mut shell) = start(interactive(), SessionConfig::default());
		let mut events = handle.subscribe();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("Enter the verification code\n").await;
		wait_for_state(&handle, SessionState::AwaitingSecondFactor).await;
		handle.submit_second_factor("987654").await.unwrap();
		let _ = shell.read_stdin_line().await;
		shell.write_stdout("Verifying 987654 for admin\nTS:CONNECTED\n").await;
		wait_for_state(&handle, SessionState::Connected).await;

		let mut outputs = Vec::new();
		while let Ok(event) = events.try_recv() {
			if let SessionEvent::Output { text } = event {
				outputs.push(text);
			}
		}
		assert!(outputs.iter().any(|t| t == "Verifying *** for admin"), "{outputs:?}");
		assert!(outputs.iter().all(|t| !t.contains("987654")));
	}

	#[tokio::test]
	async fn shutdown_kills_shell_and_rejects_pending() {
		let (handle, mut shell) = start(certificate(), SessionConfig::default());
		connect(&handle, &mut shell).await;

		let pending = tokio::spawn({
			let handle = handle.clone();
			async move { handle.run(structured("Get-CsOnlineUser")).await }
		});
		let _ = shell.read_stdin_line().await;

		handle.shutdown("closed by operator").await;
		assert!(shell.was_killed());
		assert!(handle.state().is_terminated());
		assert_eq!(handle.snapshot().pid, None);
		assert!(matches!(pending.await.unwrap(), Err(Error::SessionClosed(_))));

		handle.shutdown("again").await;
		assert!(matches!(handle.run(structured("x")).await, Err(Error::SessionClosed(_))));
	}

	#[test]
	fn session_id_round_trips_through_display() {
		let id = SessionId::new();
		assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
		assert!("not-a-session".parse::<SessionId>().is_err());
	}
}
