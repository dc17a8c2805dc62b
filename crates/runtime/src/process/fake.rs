//! In-memory shell for exercising sessions without spawning processes.
//!
//! # Example
//!
//! ```ignore
//! let (process, mut controller) = FakeProcessBuilder::new().build();
//! let handle = Session::start(info, descriptor, process, config);
//!
//! let bootstrap = controller.read_stdin_line().await.unwrap();
//! controller.write_stdout("TS:CONNECTED\n").await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::sync::watch;

use super::{ProcessControl, SpawnedProcess};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Builder for fake shell processes.
pub struct FakeProcessBuilder {
	pid: Option<u32>,
}

impl FakeProcessBuilder {
	pub fn new() -> Self {
		Self { pid: Some(4242) }
	}

	/// Overrides the reported process id.
	pub fn pid(mut self, pid: Option<u32>) -> Self {
		self.pid = pid;
		self
	}

	/// Builds the process handed to a session plus the controller that plays the shell.
	pub fn build(self) -> (SpawnedProcess, FakeProcessController) {
		let (stdin_session, stdin_shell) = duplex(PIPE_CAPACITY);
		let (stdout_shell, stdout_session) = duplex(PIPE_CAPACITY);
		let (stderr_shell, stderr_session) = duplex(PIPE_CAPACITY);
		let (exit_tx, exit_rx) = watch::channel(None);
		let killed = Arc::new(AtomicBool::new(false));

		let process = SpawnedProcess {
			stdin: Box::new(stdin_session),
			stdout: Box::new(stdout_session),
			stderr: Box::new(stderr_session),
			control: Box::new(FakeProcess {
				pid: self.pid,
				exit_tx: exit_tx.clone(),
				exit_rx,
				killed: Arc::clone(&killed),
			}),
		};

		let controller = FakeProcessController {
			stdin: BufReader::new(stdin_shell),
			stdout: Some(stdout_shell),
			stderr: Some(stderr_shell),
			exit_tx,
			killed,
		};

		(process, controller)
	}
}

impl Default for FakeProcessBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Plays the shell side: reads what the session wrote and produces output.
///
/// Dropping the controller behaves like the process dying.
pub struct FakeProcessController {
	stdin: BufReader<DuplexStream>,
	stdout: Option<DuplexStream>,
	stderr: Option<DuplexStream>,
	exit_tx: watch::Sender<Option<Option<i32>>>,
	killed: Arc<AtomicBool>,
}

impl FakeProcessController {
	/// Writes text to the session's stdout pipe exactly as given (no newline added).
	pub async fn write_stdout(&mut self, text: &str) {
		self.write_stdout_bytes(text.as_bytes()).await;
	}

	pub async fn write_stdout_bytes(&mut self, bytes: &[u8]) {
		if let Some(stdout) = self.stdout.as_mut() {
			let _ = stdout.write_all(bytes).await;
			let _ = stdout.flush().await;
		}
	}

	pub async fn write_stderr(&mut self, text: &str) {
		if let Some(stderr) = self.stderr.as_mut() {
			let _ = stderr.write_all(text.as_bytes()).await;
			let _ = stderr.flush().await;
		}
	}

	/// Reads the next line the session wrote to stdin, without its terminator.
	pub async fn read_stdin_line(&mut self) -> Option<String> {
		let mut line = String::new();
		match self.stdin.read_line(&mut line).await {
			Ok(0) | Err(_) => None,
			Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
		}
	}

	/// Closes stdout and stderr, as a process does on exit.
	pub fn close_output(&mut self) {
		self.stdout = None;
		self.stderr = None;
	}

	/// Simulates the process exiting with `code`.
	pub fn exit(&mut self, code: i32) {
		self.close_output();
		self.exit_tx.send_replace(Some(Some(code)));
	}

	pub fn has_exited(&self) -> bool {
		self.exit_tx.borrow().is_some()
	}

	/// Whether the session killed the process.
	pub fn was_killed(&self) -> bool {
		self.killed.load(Ordering::SeqCst)
	}
}

impl Drop for FakeProcessController {
	fn drop(&mut self) {
		if self.exit_tx.borrow().is_none() {
			self.exit_tx.send_replace(Some(None));
		}
	}
}

struct FakeProcess {
	pid: Option<u32>,
	exit_tx: watch::Sender<Option<Option<i32>>>,
	exit_rx: watch::Receiver<Option<Option<i32>>>,
	killed: Arc<AtomicBool>,
}

impl ProcessControl for FakeProcess {
	fn id(&self) -> Option<u32> {
		if self.exit_rx.borrow().is_some() { None } else { self.pid }
	}

	fn wait(&mut self) -> Pin<Box<dyn Future<Output = std::io::Result<Option<i32>>> + Send + '_>> {
		let mut rx = self.exit_rx.clone();
		Box::pin(async move {
			let status: Option<Option<i32>> = *rx
				.wait_for(Option::is_some)
				.await
				.map_err(|_| std::io::Error::other("fake process channel closed"))?;
			Ok(status.flatten())
		})
	}

	fn start_kill(&mut self) -> std::io::Result<()> {
		if self.exit_rx.borrow().is_none() {
			self.killed.store(true, Ordering::SeqCst);
			self.exit_tx.send_replace(Some(None));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn pipes_connect_session_and_controller() {
		let (mut process, mut controller) = FakeProcessBuilder::new().build();

		process.stdin.write_all(b"Get-CsOnlineUser\n").await.unwrap();
		assert_eq!(controller.read_stdin_line().await.as_deref(), Some("Get-CsOnlineUser"));

		controller.write_stdout("hello\n").await;
		let mut buf = [0u8; 16];
		let n = process.stdout.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"hello\n");
	}

	#[tokio::test]
	async fn exit_resolves_wait_and_closes_output() {
		let (mut process, mut controller) = FakeProcessBuilder::new().build();
		assert_eq!(process.control.id(), Some(4242));

		controller.exit(3);
		assert_eq!(process.control.wait().await.unwrap(), Some(3));
		assert_eq!(process.control.id(), None);

		let mut buf = Vec::new();
		process.stdout.read_to_end(&mut buf).await.unwrap();
		assert!(buf.is_empty());
	}

	#[tokio::test]
	async fn kill_is_observable_by_controller() {
		let (mut process, controller) = FakeProcessBuilder::new().build();
		process.control.start_kill().unwrap();
		assert!(controller.was_killed());
		assert!(controller.has_exited());
		assert_eq!(process.control.wait().await.unwrap(), None);
	}

	#[tokio::test]
	async fn dropping_controller_ends_process() {
		let (mut process, controller) = FakeProcessBuilder::new().build();
		drop(controller);
		assert_eq!(process.control.wait().await.unwrap(), None);
	}
}
