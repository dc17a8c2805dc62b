//! Shell process launch and authentication templates.
//!
//! Each credential variant maps to exactly one bootstrap script. Both
//! scripts report their outcome with a marker line ([`CONNECTED_MARKER`] or
//! [`AUTH_FAILED_MARKER`]) that the session's parser classifies.

use std::path::Path;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::credential::CredentialDescriptor;
use crate::error::{Error, Result};
use crate::operations::quote;
use crate::process::SpawnedProcess;
use crate::process::fake::{FakeProcessBuilder, FakeProcessController};

/// Printed by the bootstrap script once the remote connection is established.
pub const CONNECTED_MARKER: &str = "TS:CONNECTED";

/// Printed by the bootstrap script, followed by the error message, when authentication throws.
pub const AUTH_FAILED_MARKER: &str = "TS:AUTH-FAILED";

/// Environment variable carrying the interactive secret into the shell.
///
/// The secret never travels over stdin, so it cannot be echoed back.
pub const SECRET_ENV: &str = "TENANTSHELL_SECRET";

/// Which shell to run and which administration module to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
	pub program: String,
	pub extra_args: Vec<String>,
	pub module: String,
}

impl Default for ShellConfig {
	fn default() -> Self {
		Self {
			program: "pwsh".to_string(),
			extra_args: Vec::new(),
			module: "MicrosoftTeams".to_string(),
		}
	}
}

impl ShellConfig {
	/// Arguments that make the shell read commands from stdin.
	///
	/// `-NonInteractive` is deliberately absent: it would turn second-factor
	/// prompts into errors instead of visible output.
	pub fn shell_args(&self) -> Vec<String> {
		let mut args: Vec<String> = ["-NoLogo", "-NoProfile", "-ExecutionPolicy", "Bypass"]
			.into_iter()
			.map(str::to_string)
			.collect();
		args.extend(self.extra_args.iter().cloned());
		args.push("-Command".to_string());
		args.push("-".to_string());
		args
	}

	/// Single-line script that authenticates the shell for `tenant`.
	pub fn bootstrap_script(&self, descriptor: &CredentialDescriptor, tenant: &str) -> String {
		let connect = match descriptor {
			CredentialDescriptor::Certificate {
				application_id,
				certificate_thumbprint,
				directory_id,
			} => {
				let directory = if directory_id.is_empty() { tenant } else { directory_id.as_str() };
				format!(
					"Connect-MicrosoftTeams -ApplicationId {} -CertificateThumbprint {} -TenantId {} | Out-Null",
					quote(application_id),
					quote(certificate_thumbprint),
					quote(directory),
				)
			}
			CredentialDescriptor::Interactive { username, .. } => format!(
				"$tsSecure = ConvertTo-SecureString $env:{SECRET_ENV} -AsPlainText -Force; \
				 Remove-Item Env:{SECRET_ENV}; \
				 $tsCredential = New-Object System.Management.Automation.PSCredential({}, $tsSecure); \
				 Connect-MicrosoftTeams -Credential $tsCredential -TenantId {} | Out-Null",
				quote(username),
				quote(tenant),
			),
		};

		format!(
			"$ErrorActionPreference = 'Stop'; try {{ Import-Module {}; {connect}; Write-Output '{CONNECTED_MARKER}' }} catch {{ Write-Output ('{AUTH_FAILED_MARKER} ' + $_.Exception.Message) }}",
			quote(&self.module),
		)
	}
}

/// A started shell plus the script that must be sent first.
pub struct LaunchedShell {
	pub process: SpawnedProcess,
	pub bootstrap: String,
}

/// Starts shells for sessions.
///
/// `launch` is synchronous so the registry can enforce its capacity limit
/// and insert the session under one lock.
pub trait Launcher: Send + Sync {
	fn launch(&self, descriptor: &CredentialDescriptor, tenant: &str) -> Result<LaunchedShell>;
}

/// Launches the configured shell as a real child process.
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher {
	config: ShellConfig,
}

impl ShellLauncher {
	pub fn new(config: ShellConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> &ShellConfig {
		&self.config
	}

	/// Resolves the shell program, honoring explicit paths before `PATH` lookup.
	pub fn resolve_program(&self) -> Result<String> {
		let program = &self.config.program;
		let looks_like_path = program.contains('/') || program.contains('\\');
		if looks_like_path {
			if Path::new(program).exists() {
				return Ok(program.clone());
			}
		} else if let Ok(path) = which::which(program) {
			return Ok(path.to_string_lossy().to_string());
		}

		Err(Error::ShellNotFound { searched: program.clone() })
	}
}

impl Launcher for ShellLauncher {
	fn launch(&self, descriptor: &CredentialDescriptor, tenant: &str) -> Result<LaunchedShell> {
		let program = self.resolve_program()?;

		let mut cmd = tokio::process::Command::new(&program);
		cmd.args(self.config.shell_args())
			.env("NO_COLOR", "1")
			.env("TERM", "dumb")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		if let CredentialDescriptor::Interactive { secret, .. } = descriptor {
			cmd.env(SECRET_ENV, secret.expose());
		}

		#[cfg(unix)]
		cmd.process_group(0);

		let child = cmd.spawn().map_err(|source| Error::LaunchFailure {
			program: program.clone(),
			source,
		})?;
		debug!(target = "tenantshell.session", program = %program, pid = ?child.id(), tenant, "shell launched");

		let process = SpawnedProcess::from_child(child).map_err(|source| Error::LaunchFailure { program, source })?;
		Ok(LaunchedShell {
			process,
			bootstrap: self.config.bootstrap_script(descriptor, tenant),
		})
	}
}

/// Launcher handing out in-memory shells; each launch delivers its controller on a channel.
pub struct FakeLauncher {
	config: ShellConfig,
	controllers: mpsc::UnboundedSender<FakeProcessController>,
	fail_next: Mutex<Option<String>>,
}

impl FakeLauncher {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeProcessController>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let launcher = Self {
			config: ShellConfig::default(),
			controllers: tx,
			fail_next: Mutex::new(None),
		};
		(launcher, rx)
	}

	/// Makes the next launch fail as if the program could not be started.
	pub fn fail_next_launch(&self, reason: impl Into<String>) {
		*self.fail_next.lock() = Some(reason.into());
	}
}

impl Launcher for FakeLauncher {
	fn launch(&self, descriptor: &CredentialDescriptor, tenant: &str) -> Result<LaunchedShell> {
		if let Some(reason) = self.fail_next.lock().take() {
			return Err(Error::LaunchFailure {
				program: self.config.program.clone(),
				source: std::io::Error::new(std::io::ErrorKind::NotFound, reason),
			});
		}

		let (process, controller) = FakeProcessBuilder::new().build();
		// A dropped receiver just means nobody drives this shell.
		let _ = self.controllers.send(controller);
		Ok(LaunchedShell {
			process,
			bootstrap: self.config.bootstrap_script(descriptor, tenant),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::credential::Secret;

	fn certificate() -> CredentialDescriptor {
		CredentialDescriptor::Certificate {
			application_id: "11111111-2222-3333-4444-555555555555".into(),
			certificate_thumbprint: "A1B2C3".into(),
			directory_id: "contoso.onmicrosoft.com".into(),
		}
	}

	fn interactive() -> CredentialDescriptor {
		CredentialDescriptor::Interactive {
			username: "admin@contoso.com".into(),
			secret: Secret::new("p@ss'word"),
		}
	}

	#[test]
	fn shell_args_read_commands_from_stdin() {
		let args = ShellConfig::default().shell_args();
		assert_eq!(args.last().map(String::as_str), Some("-"));
		assert!(args.contains(&"-NoProfile".to_string()));
		assert!(!args.iter().any(|a| a == "-NonInteractive"));
	}

	#[test]
	fn certificate_template_is_non_interactive() {
		let script = ShellConfig::default().bootstrap_script(&certificate(), "tenant-a");
		assert!(script.contains("-CertificateThumbprint 'A1B2C3'"));
		assert!(script.contains("-TenantId 'contoso.onmicrosoft.com'"));
		assert!(!script.contains("PSCredential"));
		assert!(script.contains(CONNECTED_MARKER));
		assert!(script.contains(AUTH_FAILED_MARKER));
		assert!(!script.contains('\n'));
	}

	#[test]
	fn interactive_template_reads_secret_from_env() {
		let script = ShellConfig::default().bootstrap_script(&interactive(), "contoso.onmicrosoft.com");
		assert!(script.contains("PSCredential('admin@contoso.com', $tsSecure)"));
		assert!(script.contains(&format!("$env:{SECRET_ENV}")));
		assert!(script.contains(&format!("Remove-Item Env:{SECRET_ENV}")));
		assert!(!script.contains("p@ss"), "secret leaked into script: {script}");
		assert!(!script.contains('\n'));
	}

	#[test]
	fn missing_program_is_shell_not_found() {
		let launcher = ShellLauncher::new(ShellConfig {
			program: "definitely-not-a-shell-tenantshell".into(),
			..ShellConfig::default()
		});
		let err = launcher.launch(&certificate(), "t").err().unwrap();
		assert!(matches!(err, Error::ShellNotFound { .. }));
		assert!(err.is_terminal());
	}

	#[tokio::test]
	async fn fake_launcher_delivers_controller_and_injects_failures() {
		let (launcher, mut controllers) = FakeLauncher::new();
		let launched = launcher.launch(&certificate(), "t").unwrap();
		assert!(launched.bootstrap.contains("Connect-MicrosoftTeams"));
		assert!(controllers.try_recv().is_ok());

		launcher.fail_next_launch("no pwsh here");
		assert!(matches!(launcher.launch(&certificate(), "t"), Err(Error::LaunchFailure { .. })));
		assert!(launcher.launch(&certificate(), "t").is_ok());
	}
}
