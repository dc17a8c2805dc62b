//! Operator to tenant authorization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Grants every tenant.
pub const ALL_TENANTS: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorEntry {
	pub id: String,
	#[serde(default)]
	pub tenants: Vec<String>,
}

/// Which tenants each operator may open sessions for.
#[derive(Debug, Clone, Default)]
pub struct OperatorDirectory {
	grants: HashMap<String, Vec<String>>,
}

impl OperatorDirectory {
	pub fn new(entries: &[OperatorEntry]) -> Self {
		let mut grants: HashMap<String, Vec<String>> = HashMap::new();
		for entry in entries {
			grants.entry(entry.id.clone()).or_default().extend(entry.tenants.iter().cloned());
		}
		Self { grants }
	}

	pub fn is_known(&self, operator: &str) -> bool {
		self.grants.contains_key(operator)
	}

	pub fn may_access(&self, operator: &str, tenant: &str) -> bool {
		self.grants
			.get(operator)
			.is_some_and(|tenants| tenants.iter().any(|t| t == ALL_TENANTS || t.eq_ignore_ascii_case(tenant)))
	}
}
