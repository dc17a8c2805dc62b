//! Relay configuration file.
//!
//! Every key is optional. Relative `tenantsFile` and `auditLog` paths are
//! resolved against the directory containing the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenantshell_runtime::{ExpiryPolicy, RegistryConfig, RuleSet, SessionConfig, ShellConfig};

use crate::error::{RelayError, Result};
use crate::operators::OperatorEntry;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "TENANTSHELL_CONFIG";

const APP_DIR: &str = "tenantshell";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub bind: String,
	pub shell: ShellSection,
	pub timeouts: Timeouts,
	pub max_sessions: usize,
	pub token_ttl_secs: u64,
	/// Environment variable holding the key that may issue operator tokens.
	pub admin_key_env: String,
	pub tenants_file: Option<PathBuf>,
	pub audit_log: Option<PathBuf>,
	pub operators: Vec<OperatorEntry>,
	/// Replaces the built-in second-factor prompt patterns.
	pub patterns: Option<Vec<String>>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind: "127.0.0.1:8787".to_string(),
			shell: ShellSection::default(),
			timeouts: Timeouts::default(),
			max_sessions: 32,
			token_ttl_secs: 300,
			admin_key_env: "TENANTSHELL_ADMIN_KEY".to_string(),
			tenants_file: None,
			audit_log: None,
			operators: Vec::new(),
			patterns: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellSection {
	pub program: String,
	pub extra_args: Vec<String>,
	pub module: String,
}

impl Default for ShellSection {
	fn default() -> Self {
		let shell = ShellConfig::default();
		Self {
			program: shell.program,
			extra_args: shell.extra_args,
			module: shell.module,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
	pub command_secs: u64,
	pub connect_secs: u64,
	pub idle_secs: u64,
	pub second_factor_secs: u64,
	pub sweep_secs: u64,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			command_secs: 60,
			connect_secs: 120,
			idle_secs: 900,
			second_factor_secs: 600,
			sweep_secs: 15,
		}
	}
}

impl Config {
	/// Reads a config file. Relative paths inside it are anchored to its directory.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path).map_err(|e| RelayError::Config {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
		let mut config: Config = serde_json::from_str(&content).map_err(|e| RelayError::Config {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
		if let Some(base) = path.parent() {
			config.anchor_paths(base);
		}
		config.validate(path)?;
		Ok(config)
	}

	/// Loads `explicit`, else the file named by [`CONFIG_ENV`], else the
	/// per-user config file if it exists, else defaults.
	pub fn discover(explicit: Option<&Path>) -> Result<Self> {
		if let Some(path) = explicit {
			return Self::load(path);
		}
		if let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
			return Self::load(&path);
		}
		match default_config_path() {
			Some(path) if path.exists() => Self::load(&path),
			_ => Ok(Self::default()),
		}
	}

	fn anchor_paths(&mut self, base: &Path) {
		for path in [&mut self.tenants_file, &mut self.audit_log].into_iter().flatten() {
			if path.is_relative() {
				*path = base.join(&*path);
			}
		}
	}

	fn validate(&self, path: &Path) -> Result<()> {
		let invalid = |message: String| RelayError::Config {
			path: path.to_path_buf(),
			message,
		};
		if self.max_sessions == 0 {
			return Err(invalid("maxSessions must be at least 1".into()));
		}
		let t = &self.timeouts;
		for (name, value) in [
			("commandSecs", t.command_secs),
			("connectSecs", t.connect_secs),
			("idleSecs", t.idle_secs),
			("secondFactorSecs", t.second_factor_secs),
			("sweepSecs", t.sweep_secs),
		] {
			if value == 0 {
				return Err(invalid(format!("timeouts.{name} must be greater than zero")));
			}
		}
		self.rule_set().map_err(|e| invalid(format!("invalid prompt pattern: {e}")))?;
		Ok(())
	}

	pub fn rule_set(&self) -> std::result::Result<RuleSet, regex::Error> {
		match &self.patterns {
			Some(patterns) => RuleSet::with_prompt_patterns(patterns),
			None => Ok(RuleSet::standard()),
		}
	}

	pub fn shell_config(&self) -> ShellConfig {
		ShellConfig {
			program: self.shell.program.clone(),
			extra_args: self.shell.extra_args.clone(),
			module: self.shell.module.clone(),
		}
	}

	pub fn registry_config(&self) -> Result<RegistryConfig> {
		let rules = self.rule_set().map_err(|e| RelayError::InvalidInput(format!("invalid prompt pattern: {e}")))?;
		Ok(RegistryConfig {
			max_sessions: self.max_sessions,
			session: SessionConfig {
				command_timeout: Duration::from_secs(self.timeouts.command_secs),
				connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
				rules,
				..SessionConfig::default()
			},
		})
	}

	pub fn expiry_policy(&self) -> ExpiryPolicy {
		ExpiryPolicy {
			idle_timeout: Duration::from_secs(self.timeouts.idle_secs),
			second_factor_timeout: Duration::from_secs(self.timeouts.second_factor_secs),
			sweep_interval: Duration::from_secs(self.timeouts.sweep_secs),
		}
	}

	pub fn token_ttl(&self) -> Duration {
		Duration::from_secs(self.token_ttl_secs)
	}

	pub fn tenants_path(&self) -> Option<PathBuf> {
		self.tenants_file
			.clone()
			.or_else(|| dirs::config_dir().map(|dir| dir.join(APP_DIR).join("tenants.json")))
	}

	pub fn audit_path(&self) -> Option<PathBuf> {
		self.audit_log
			.clone()
			.or_else(|| dirs::data_dir().map(|dir| dir.join(APP_DIR).join("audit.jsonl")))
	}
}

pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
}
