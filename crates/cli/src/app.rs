//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{Context, Result};
use tenantshell_runtime::{SessionRegistry, ShellLauncher, Supervisor};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::audit::JsonlAuditSink;
use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::credential_store::JsonFileCredentialStore;
use crate::operators::OperatorDirectory;
use crate::relay::{self, RelayState};
use crate::tokens::TokenStore;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let config = Config::discover(cli.config.as_deref())?;
	match cli.command {
		Commands::Serve { bind } => serve(config, bind).await,
		Commands::CheckConfig => check_config(&config).await,
	}
}

/// Runs the relay until Ctrl+C, then terminates every session.
pub async fn serve(config: Config, bind: Option<String>) -> Result<()> {
	let launcher = ShellLauncher::new(config.shell_config());
	match launcher.resolve_program() {
		Ok(program) => info!(target = "tenantshell", program = %program, "shell resolved"),
		Err(e) => warn!(target = "tenantshell", error = %e, "shell not found; session creation will fail"),
	}

	let registry = Arc::new(SessionRegistry::new(Arc::new(launcher), config.registry_config()?));
	let tenants = config.tenants_path().context("no tenants file configured and no config directory")?;
	let audit_log = config.audit_path().context("no audit log configured and no data directory")?;
	let admin_key = std::env::var(&config.admin_key_env).ok().filter(|key| !key.is_empty());
	if admin_key.is_none() {
		warn!(target = "tenantshell", env = %config.admin_key_env, "admin key not set; token issuance disabled");
	}
	if config.operators.is_empty() {
		warn!(target = "tenantshell", "no operators configured; every token request will be refused");
	}

	let state = Arc::new(RelayState {
		registry: Arc::clone(&registry),
		tokens: TokenStore::new(config.token_ttl()),
		operators: OperatorDirectory::new(&config.operators),
		credentials: Arc::new(JsonFileCredentialStore::new(&tenants)),
		audit: Arc::new(JsonlAuditSink::new(&audit_log)),
		admin_key,
	});

	let (stop_supervisor, stopped) = oneshot::channel::<()>();
	let supervisor = Supervisor::new(Arc::clone(&registry), config.expiry_policy()).spawn(async move {
		let _ = stopped.await;
	});

	let bind = bind.unwrap_or_else(|| config.bind.clone());
	let listener = TcpListener::bind(&bind).await.with_context(|| format!("failed to bind to {bind}"))?;
	info!(
		target = "tenantshell",
		addr = %listener.local_addr()?,
		tenants = %tenants.display(),
		audit_log = %audit_log.display(),
		"relay listening"
	);

	relay::serve(listener, state, shutdown_signal()).await?;

	let _ = stop_supervisor.send(());
	let _ = supervisor.await;
	registry.shutdown_all("server shutting down").await;
	info!(target = "tenantshell", "relay stopped");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(target = "tenantshell", error = %e, "could not listen for Ctrl+C");
		std::future::pending::<()>().await;
	}
	info!(target = "tenantshell", "shutdown requested");
}

/// Prints the effective configuration and the tenant records it can see.
pub async fn check_config(config: &Config) -> Result<()> {
	let launcher = ShellLauncher::new(config.shell_config());
	println!("bind:          {}", config.bind);
	match launcher.resolve_program() {
		Ok(program) => println!("shell:         {program}"),
		Err(e) => println!("shell:         {e}"),
	}
	println!("module:        {}", config.shell.module);
	println!("max sessions:  {}", config.max_sessions);
	println!("operators:     {}", config.operators.len());
	println!(
		"patterns:      {}",
		if config.patterns.is_some() { "custom" } else { "built-in" }
	);

	if let Some(audit) = config.audit_path() {
		println!("audit log:     {}", audit.display());
	}
	let tenants = config.tenants_path().context("no tenants file configured and no config directory")?;
	let store = JsonFileCredentialStore::new(&tenants);
	let names = store.names().await?;
	println!("tenants file:  {} ({} records)", tenants.display(), names.len());
	for name in names {
		println!("  {name}");
	}
	Ok(())
}
