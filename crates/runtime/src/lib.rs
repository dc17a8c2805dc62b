//! Session runtime for tenant administration shells.
//!
//! This crate spawns one long-lived PowerShell process per session, drives
//! it through its authentication flow, and turns its free-text output into
//! structured events and command results.
//!
//! # Modules
//!
//! * [`launcher`]: shell spawning and the two authentication templates
//! * [`parser`]: chunk reassembly, echo filtering and the ordered rule list
//! * [`dispatcher`]: FIFO command queue with one command in flight
//! * [`session`]: the per-session actor and its handle
//! * [`registry`]: the session map with capacity limits
//! * [`supervisor`]: periodic reclamation of idle and abandoned sessions
//! * [`operations`]: scripts for the high-level operation catalogue
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SessionRegistry::new(Arc::new(ShellLauncher::default()), RegistryConfig::default()));
//! let session = registry.create("alice", "contoso.onmicrosoft.com", &descriptor)?;
//! let mut events = session.subscribe();
//! ```

pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod launcher;
pub mod operations;
pub mod parser;
pub mod process;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use credential::{CredentialDescriptor, Secret};
pub use dispatcher::Command;
pub use error::{Error, Result, TimeoutKind};
pub use launcher::{FakeLauncher, LaunchedShell, Launcher, ShellConfig, ShellLauncher};
pub use operations::{OperationOutcome, execute};
pub use parser::{Matcher, OutputEvent, OutputParser, RuleKind, RuleSet, Sentinels};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{Session, SessionConfig, SessionEvent, SessionHandle, SessionId, SessionInfo, SessionSnapshot};
pub use supervisor::{ExpiryPolicy, ExpiryReason, Supervisor};
