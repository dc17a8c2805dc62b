use clap::ValueEnum;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

/// Default directive for a `-v` count. `RUST_LOG` overrides it.
pub fn default_directive(verbose: u8) -> &'static str {
	match verbose {
		0 => "tenantshell=info,tenantshell_runtime=info",
		1 => "tenantshell=debug,tenantshell_runtime=debug",
		_ => "tenantshell=trace,tenantshell_runtime=trace,axum=debug",
	}
}

/// Installs the global subscriber. Logs go to stderr.
pub fn init_logging(verbose: u8, format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
	let registry = tracing_subscriber::registry().with(filter);

	let result = match format {
		LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
		LogFormat::Json => registry
			.with(fmt::layer().json().with_current_span(false).with_writer(std::io::stderr))
			.try_init(),
	};
	if let Err(e) = result {
		eprintln!("logging already initialised: {e}");
	}
}
