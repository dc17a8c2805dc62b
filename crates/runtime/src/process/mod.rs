//! Subprocess handles owned by sessions.
//!
//! A session talks to its shell through three byte pipes and a
//! [`ProcessControl`] for lifecycle. Real shells are wrapped by
//! [`ChildProcess`]; tests use the in-memory pair from [`fake`].

pub mod fake;

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

/// Lifecycle control for a spawned shell.
pub trait ProcessControl: Send {
	/// OS process id while the process is running.
	fn id(&self) -> Option<u32>;

	/// Waits for exit and returns the exit code (`None` when killed by a signal).
	///
	/// Must be cancel-safe: sessions poll it inside `select!`.
	fn wait(&mut self) -> Pin<Box<dyn Future<Output = std::io::Result<Option<i32>>> + Send + '_>>;

	/// Requests termination without waiting.
	///
	/// Shells launched as group leaders take their whole process group with them.
	fn start_kill(&mut self) -> std::io::Result<()>;
}

/// A running shell with its three pipes detached from the control handle.
pub struct SpawnedProcess {
	pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
	pub stdout: Box<dyn AsyncRead + Send + Unpin>,
	pub stderr: Box<dyn AsyncRead + Send + Unpin>,
	pub control: Box<dyn ProcessControl>,
}

impl SpawnedProcess {
	/// Takes the pipes out of a child spawned with all three set to `Stdio::piped()`.
	pub fn from_child(mut child: Child) -> std::io::Result<Self> {
		let missing = |name: &str| std::io::Error::other(format!("child {name} was not piped"));
		let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
		let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
		let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
		Ok(Self {
			stdin: Box::new(stdin),
			stdout: Box::new(stdout),
			stderr: Box::new(stderr),
			control: Box::new(ChildProcess { child }),
		})
	}
}

/// [`ProcessControl`] over a tokio child process.
pub struct ChildProcess {
	child: Child,
}

impl ProcessControl for ChildProcess {
	fn id(&self) -> Option<u32> {
		self.child.id()
	}

	fn wait(&mut self) -> Pin<Box<dyn Future<Output = std::io::Result<Option<i32>>> + Send + '_>> {
		Box::pin(async move { self.child.wait().await.map(|status| status.code()) })
	}

	fn start_kill(&mut self) -> std::io::Result<()> {
		#[cfg(unix)]
		let group = match self.child.id() {
			Some(pid) => kill_group(pid),
			None => Ok(()),
		};
		#[cfg(not(unix))]
		let group: std::io::Result<()> = Ok(());

		let leader = match self.child.start_kill() {
			// Already exited and reaped.
			Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
			other => other,
		};
		group.and(leader)
	}
}

/// Sends SIGKILL to the process group led by `pid`.
///
/// A missing group is not an error: the child may not lead one.
#[cfg(unix)]
fn kill_group(pid: u32) -> std::io::Result<()> {
	let Ok(pgid) = libc::pid_t::try_from(pid) else {
		return Ok(());
	};
	// SAFETY: kill(2) takes plain integers and touches no memory.
	if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
		return Ok(());
	}
	let err = std::io::Error::last_os_error();
	if err.raw_os_error() == Some(libc::ESRCH) { Ok(()) } else { Err(err) }
}

/// Returns `true` when a process with `pid` appears alive on this platform.
///
/// Used after reclamation to confirm no shell was left behind.
pub fn pid_is_alive(pid: u32) -> bool {
	#[cfg(unix)]
	{
		if pid == 0 {
			return false;
		}

		let proc_dir = std::path::PathBuf::from("/proc").join(pid.to_string());
		if proc_dir.exists() {
			// Zombies keep their /proc entry until reaped.
			return std::fs::read_to_string(proc_dir.join("stat")).map(|stat| !stat_is_zombie(&stat)).unwrap_or(true);
		}

		std::process::Command::new("kill")
			.arg("-0")
			.arg(pid.to_string())
			.status()
			.map(|status| status.success())
			.unwrap_or(pid == std::process::id())
	}

	#[cfg(not(unix))]
	{
		pid == std::process::id()
	}
}

/// The state field follows the parenthesised command name in `/proc/<pid>/stat`.
#[cfg(any(test, unix))]
fn stat_is_zombie(stat: &str) -> bool {
	stat.rsplit_once(')')
		.and_then(|(_, rest)| rest.split_whitespace().next())
		.is_some_and(|state| state == "Z")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stat_parser_detects_zombie() {
		assert!(stat_is_zombie("1234 (pwsh) Z 1 1234 1234 0 -1"));
		assert!(!stat_is_zombie("1234 (pwsh) S 1 1234 1234 0 -1"));
		assert!(!stat_is_zombie("1234 (weird) name) R 1"));
	}

	#[cfg(unix)]
	#[test]
	fn current_process_is_alive() {
		assert!(pid_is_alive(std::process::id()));
	}

	#[cfg(unix)]
	#[test]
	fn pid_zero_is_never_alive() {
		assert!(!pid_is_alive(0));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn kill_reaches_background_children_of_the_shell() {
		use tokio::io::{AsyncBufReadExt, BufReader};

		let child = tokio::process::Command::new("sh")
			.args(["-c", "sleep 30 & echo $!; wait"])
			.process_group(0)
			.stdin(std::process::Stdio::piped())
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.unwrap();
		let mut spawned = SpawnedProcess::from_child(child).unwrap();
		let mut stdout = BufReader::new(spawned.stdout);
		let mut line = String::new();
		stdout.read_line(&mut line).await.unwrap();
		let background: u32 = line.trim().parse().unwrap();
		assert!(pid_is_alive(background));

		spawned.control.start_kill().unwrap();
		spawned.control.wait().await.unwrap();

		let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
		while pid_is_alive(background) && tokio::time::Instant::now() < deadline {
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		}
		assert!(!pid_is_alive(background), "background process {background} survived the kill");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn reaped_child_is_not_alive() {
		let child = tokio::process::Command::new("true")
			.stdin(std::process::Stdio::piped())
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::piped())
			.spawn()
			.unwrap();
		let mut spawned = SpawnedProcess::from_child(child).unwrap();
		let pid = spawned.control.id().unwrap();
		let code = spawned.control.wait().await.unwrap();
		assert_eq!(code, Some(0));
		assert!(!pid_is_alive(pid));
		spawned.control.start_kill().unwrap();
	}
}
