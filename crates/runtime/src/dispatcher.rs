//! FIFO command queue for one shell.
//!
//! Exactly one command is in flight at a time. Commands without sentinels
//! resolve as soon as they are written; commands with sentinels resolve on
//! the matching block end, an explicit failure marker, or their deadline.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result, TimeoutKind};
use crate::parser::{OutputEvent, OutputParser, Sentinels};

/// Text sent to the shell, optionally expecting a structured result.
#[derive(Debug, Clone)]
pub struct Command {
	pub text: String,
	pub sentinels: Option<Sentinels>,
	/// Overrides the dispatcher's default deadline.
	pub timeout: Option<Duration>,
}

impl Command {
	/// A command whose completion is not observed.
	pub fn fire_and_forget(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			sentinels: None,
			timeout: None,
		}
	}

	/// A command that resolves with the JSON printed between `sentinels`.
	pub fn structured(text: impl Into<String>, sentinels: Sentinels) -> Self {
		Self {
			text: text.into(),
			sentinels: Some(sentinels),
			timeout: None,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}
}

pub type Reply = oneshot::Sender<Result<Value>>;

struct Pending {
	command: Command,
	reply: Option<Reply>,
	submitted_at: Instant,
}

struct InFlight {
	reply: Option<Reply>,
	deadline: Instant,
	timeout: Duration,
	started_at: Instant,
}

/// Writes queued commands to the shell's stdin and correlates their results.
pub struct Dispatcher {
	stdin: Box<dyn AsyncWrite + Send + Unpin>,
	queue: VecDeque<Pending>,
	in_flight: Option<InFlight>,
	default_timeout: Duration,
}

impl Dispatcher {
	pub fn new(stdin: Box<dyn AsyncWrite + Send + Unpin>, default_timeout: Duration) -> Self {
		Self {
			stdin,
			queue: VecDeque::new(),
			in_flight: None,
			default_timeout,
		}
	}

	pub fn enqueue(&mut self, command: Command, reply: Option<Reply>) {
		self.queue.push_back(Pending {
			command,
			reply,
			submitted_at: Instant::now(),
		});
	}

	pub fn is_busy(&self) -> bool {
		self.in_flight.is_some()
	}

	pub fn queued(&self) -> usize {
		self.queue.len()
	}

	/// Deadline of the in-flight command.
	pub fn deadline(&self) -> Option<Instant> {
		self.in_flight.as_ref().map(|f| f.deadline)
	}

	/// Writes queued commands until one needs a structured result.
	///
	/// A write error is returned after every waiting caller has been rejected;
	/// the shell is unusable at that point.
	pub async fn pump(&mut self, parser: &mut OutputParser) -> Result<()> {
		while self.in_flight.is_none() {
			let Some(pending) = self.queue.pop_front() else {
				return Ok(());
			};

			if let Err(e) = self.write_line(&pending.command.text).await {
				if let Some(reply) = pending.reply {
					let _ = reply.send(Err(Error::SessionClosed(format!("write to shell failed: {e}"))));
				}
				self.reject_all(|| Error::SessionClosed("shell input closed".to_string()));
				return Err(Error::Io(e));
			}
			parser.note_written(&pending.command.text);

			let queued_for = pending.submitted_at.elapsed();
			match pending.command.sentinels {
				Some(sentinels) => {
					let timeout = pending.command.timeout.unwrap_or(self.default_timeout);
					parser.arm(sentinels);
					let now = Instant::now();
					self.in_flight = Some(InFlight {
						reply: pending.reply,
						deadline: now + timeout,
						timeout,
						started_at: now,
					});
					debug!(target = "tenantshell.session", ?queued_for, ?timeout, "command in flight");
				}
				None => {
					if let Some(reply) = pending.reply {
						let _ = reply.send(Ok(Value::Null));
					}
				}
			}
		}
		Ok(())
	}

	/// Resolves the in-flight command if `event` completes it.
	///
	/// Returns `true` when a command was resolved.
	pub fn resolve(&mut self, event: &OutputEvent) -> bool {
		let outcome = match event {
			OutputEvent::BlockEnd(Ok(value)) => Ok(value.clone()),
			OutputEvent::BlockEnd(Err(malformed)) => Err(Error::MalformedResult {
				message: malformed.message.clone(),
				raw: malformed.raw.clone(),
			}),
			OutputEvent::CommandFailed(message) => Err(Error::CommandFailed(message.clone())),
			_ => return false,
		};

		let Some(in_flight) = self.in_flight.take() else {
			return false;
		};
		debug!(
			target = "tenantshell.session",
			elapsed = ?in_flight.started_at.elapsed(),
			ok = outcome.is_ok(),
			"command resolved"
		);
		if let Some(reply) = in_flight.reply {
			let _ = reply.send(outcome);
		}
		true
	}

	/// Rejects the in-flight command if its deadline has passed.
	///
	/// The parser is disarmed so late output of the abandoned command stays raw.
	pub fn expire(&mut self, parser: &mut OutputParser) -> bool {
		let expired = self.in_flight.as_ref().is_some_and(|f| f.deadline <= Instant::now());
		if !expired {
			return false;
		}
		let Some(in_flight) = self.in_flight.take() else {
			return false;
		};
		parser.disarm();
		warn!(target = "tenantshell.session", timeout = ?in_flight.timeout, "command timed out");
		if let Some(reply) = in_flight.reply {
			let _ = reply.send(Err(Error::Timeout {
				what: TimeoutKind::Command,
				after: in_flight.timeout,
			}));
		}
		true
	}

	/// Writes `text` straight to stdin, bypassing the queue. Nothing is logged.
	pub async fn write_raw(&mut self, text: &str) -> std::io::Result<()> {
		self.write_line(text).await
	}

	/// Rejects every waiting caller, in flight first, then in queue order.
	pub fn reject_all(&mut self, mut error: impl FnMut() -> Error) {
		if let Some(in_flight) = self.in_flight.take() {
			if let Some(reply) = in_flight.reply {
				let _ = reply.send(Err(error()));
			}
		}
		for pending in self.queue.drain(..) {
			if let Some(reply) = pending.reply {
				let _ = reply.send(Err(error()));
			}
		}
	}

	async fn write_line(&mut self, text: &str) -> std::io::Result<()> {
		let mut line = String::with_capacity(text.len() + 1);
		line.push_str(text);
		line.push('\n');
		let limit = self.default_timeout;
		let stdin = &mut self.stdin;
		let write = async move {
			stdin.write_all(line.as_bytes()).await?;
			stdin.flush().await
		};
		match tokio::time::timeout(limit, write).await {
			Ok(result) => result,
			Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "shell stopped reading its input")),
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::parser::{MalformedBlock, RuleSet};
	use crate::process::fake::FakeProcessBuilder;

	fn setup() -> (Dispatcher, OutputParser, crate::process::fake::FakeProcessController) {
		let (process, controller) = FakeProcessBuilder::new().build();
		let dispatcher = Dispatcher::new(process.stdin, Duration::from_secs(60));
		(dispatcher, OutputParser::new(RuleSet::standard()), controller)
	}

	#[tokio::test]
	async fn fire_and_forget_resolves_on_write() {
		let (mut dispatcher, mut parser, mut shell) = setup();
		let (tx, rx) = oneshot::channel();
		dispatcher.enqueue(Command::fire_and_forget("Import-Module MicrosoftTeams"), Some(tx));
		dispatcher.pump(&mut parser).await.unwrap();

		assert_eq!(rx.await.unwrap().unwrap(), Value::Null);
		assert!(!dispatcher.is_busy());
		assert_eq!(shell.read_stdin_line().await.as_deref(), Some("Import-Module MicrosoftTeams"));
	}

	#[tokio::test]
	async fn commands_resolve_in_submission_order() {
		let (mut dispatcher, mut parser, mut shell) = setup();
		let mut replies = Vec::new();
		for i in 0..5 {
			let (tx, rx) = oneshot::channel();
			dispatcher.enqueue(Command::structured(format!("cmd-{i}"), Sentinels::for_tag(&format!("t{i}"))), Some(tx));
			replies.push(rx);
		}

		for i in 0..5 {
			dispatcher.pump(&mut parser).await.unwrap();
			assert_eq!(dispatcher.queued(), 4 - i);
			assert_eq!(shell.read_stdin_line().await, Some(format!("cmd-{i}")));

			let output = format!("<<<TS:BEGIN:t{i}>>>\n{i}\n<<<TS:END:t{i}>>>\n");
			parser.feed(output.as_bytes());
			let events: Vec<_> = parser.drain().collect();
			assert!(events.iter().any(|e| dispatcher.resolve(e)));
		}

		for (i, rx) in replies.into_iter().enumerate() {
			assert_eq!(rx.await.unwrap().unwrap(), json!(i));
		}
	}

	#[tokio::test]
	async fn malformed_block_rejects_only_that_command() {
		let (mut dispatcher, mut parser, _shell) = setup();
		let (tx, rx) = oneshot::channel();
		dispatcher.enqueue(Command::structured("bad", Sentinels::for_tag("b")), Some(tx));
		dispatcher.pump(&mut parser).await.unwrap();

		let event = OutputEvent::BlockEnd(Err(MalformedBlock {
			message: "expected value".into(),
			raw: "{oops".into(),
		}));
		assert!(dispatcher.resolve(&event));
		assert!(matches!(rx.await.unwrap(), Err(Error::MalformedResult { .. })));
		assert!(!dispatcher.is_busy());
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_rejects_with_command_timeout() {
		let (mut dispatcher, mut parser, _shell) = setup();
		let (tx, rx) = oneshot::channel();
		dispatcher.enqueue(
			Command::structured("Get-CsOnlineUser", Sentinels::for_tag("slow")).with_timeout(Duration::from_secs(5)),
			Some(tx),
		);
		dispatcher.pump(&mut parser).await.unwrap();
		assert!(parser.is_armed());
		assert!(!dispatcher.expire(&mut parser));

		tokio::time::advance(Duration::from_secs(6)).await;
		assert!(dispatcher.expire(&mut parser));
		assert!(!parser.is_armed());
		let err = rx.await.unwrap().unwrap_err();
		assert!(matches!(err, Error::Timeout { what: TimeoutKind::Command, .. }));
	}

	#[tokio::test]
	async fn reject_all_drains_queue() {
		let (mut dispatcher, mut parser, _shell) = setup();
		let (tx1, rx1) = oneshot::channel();
		let (tx2, rx2) = oneshot::channel();
		dispatcher.enqueue(Command::structured("a", Sentinels::for_tag("a")), Some(tx1));
		dispatcher.enqueue(Command::structured("b", Sentinels::for_tag("b")), Some(tx2));
		dispatcher.pump(&mut parser).await.unwrap();

		dispatcher.reject_all(|| Error::SessionClosed("closed by operator".into()));
		assert!(matches!(rx1.await.unwrap(), Err(Error::SessionClosed(_))));
		assert!(matches!(rx2.await.unwrap(), Err(Error::SessionClosed(_))));
		assert_eq!(dispatcher.queued(), 0);
	}

	#[tokio::test]
	async fn write_failure_rejects_waiters() {
		let (process, shell) = FakeProcessBuilder::new().build();
		drop(shell);
		let mut dispatcher = Dispatcher::new(process.stdin, Duration::from_secs(1));
		let mut parser = OutputParser::new(RuleSet::standard());
		let (tx, rx) = oneshot::channel();
		dispatcher.enqueue(Command::structured("x", Sentinels::for_tag("x")), Some(tx));

		assert!(dispatcher.pump(&mut parser).await.is_err());
		assert!(matches!(rx.await.unwrap(), Err(Error::SessionClosed(_))));
	}
}
