use clap::Parser;
use tenantshell::{app, cli::Cli, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose, cli.log_format);

	if let Err(err) = app::dispatch(cli).await {
		error!(target = "tenantshell", error = %format_args!("{err:#}"), "command failed");
		std::process::exit(1);
	}
}
