use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CONFIG_ENV;
use crate::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "tenantshell")]
#[command(about = "Relay browser clients to tenant administration shell sessions")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v debug, -vv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Log output format
	#[arg(long, global = true, value_enum, default_value = "text")]
	pub log_format: LogFormat,

	/// Config file (JSON)
	#[arg(short, long, global = true, value_name = "FILE", env = CONFIG_ENV)]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Start the WebSocket relay
	Serve {
		/// Address to listen on, overriding the config file
		#[arg(long, value_name = "ADDR")]
		bind: Option<String>,
	},

	/// Validate the config and tenants files, then exit
	CheckConfig,
}
