//! Wire types for the tenantshell relay protocol.
//!
//! This crate contains the serde-serializable types exchanged between the
//! browser client and the relay server, plus the shapes shared with the
//! audit collaborator. These types represent the "protocol layer": the
//! shapes of data as they appear on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization and
//!   argument validation for the operation catalogue
//! * Stable: Changes only when the wire protocol changes
//!
//! Session management built on top of these types lives in `tenantshell-runtime`.

pub mod audit;
pub mod messages;
pub mod operation;
pub mod types;

pub use audit::*;
pub use messages::*;
pub use operation::*;
pub use types::*;
