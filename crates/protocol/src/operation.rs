//! Catalogue of high-level operations a client may run on a connected session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated high-level operation.
///
/// On the wire an operation is the `operation` name plus an `args` object:
///
/// ```json
/// { "operation": "assign_phone_number",
///   "args": { "identity": "bob@contoso.com", "phoneNumber": "+15550100", "numberType": "DirectRouting" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "args", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Operation {
	GetUser {
		identity: String,
	},
	ListPhoneNumbers {
		#[serde(default)]
		filter: Option<String>,
	},
	AssignPhoneNumber {
		identity: String,
		phone_number: String,
		number_type: NumberType,
	},
	UnassignPhoneNumber {
		identity: String,
		phone_number: String,
		number_type: NumberType,
	},
	GrantPolicy {
		identity: String,
		policy_type: PolicyType,
		policy_name: String,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberType {
	DirectRouting,
	CallingPlan,
	OperatorConnect,
}

impl NumberType {
	pub fn as_str(self) -> &'static str {
		match self {
			NumberType::DirectRouting => "DirectRouting",
			NumberType::CallingPlan => "CallingPlan",
			NumberType::OperatorConnect => "OperatorConnect",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
	OnlineVoiceRoutingPolicy,
	TenantDialPlan,
	TeamsCallingPolicy,
	TeamsEmergencyCallingPolicy,
}

impl PolicyType {
	pub fn as_str(self) -> &'static str {
		match self {
			PolicyType::OnlineVoiceRoutingPolicy => "OnlineVoiceRoutingPolicy",
			PolicyType::TenantDialPlan => "TenantDialPlan",
			PolicyType::TeamsCallingPolicy => "TeamsCallingPolicy",
			PolicyType::TeamsEmergencyCallingPolicy => "TeamsEmergencyCallingPolicy",
		}
	}
}

impl Operation {
	/// Parses and validates a `run_operation` payload.
	pub fn parse(name: &str, args: Value) -> Result<Self, String> {
		let args = if args.is_null() { Value::Object(Default::default()) } else { args };
		let op: Operation = serde_json::from_value(serde_json::json!({ "operation": name, "args": args }))
			.map_err(|e| format!("invalid operation `{name}`: {e}"))?;
		op.validate()?;
		Ok(op)
	}

	pub fn name(&self) -> &'static str {
		match self {
			Operation::GetUser { .. } => "get_user",
			Operation::ListPhoneNumbers { .. } => "list_phone_numbers",
			Operation::AssignPhoneNumber { .. } => "assign_phone_number",
			Operation::UnassignPhoneNumber { .. } => "unassign_phone_number",
			Operation::GrantPolicy { .. } => "grant_policy",
		}
	}

	/// The user this operation reads or changes.
	pub fn target_identity(&self) -> Option<&str> {
		match self {
			Operation::GetUser { identity }
			| Operation::AssignPhoneNumber { identity, .. }
			| Operation::UnassignPhoneNumber { identity, .. }
			| Operation::GrantPolicy { identity, .. } => Some(identity),
			Operation::ListPhoneNumbers { .. } => None,
		}
	}

	/// Mutating operations get before/after snapshots in their audit record.
	pub fn is_mutating(&self) -> bool {
		matches!(
			self,
			Operation::AssignPhoneNumber { .. } | Operation::UnassignPhoneNumber { .. } | Operation::GrantPolicy { .. }
		)
	}

	fn validate(&self) -> Result<(), String> {
		if let Some(identity) = self.target_identity() {
			if identity.trim().is_empty() {
				return Err("identity must not be empty".to_string());
			}
		}
		match self {
			Operation::AssignPhoneNumber { phone_number, .. } | Operation::UnassignPhoneNumber { phone_number, .. } => {
				validate_phone_number(phone_number)
			}
			Operation::GrantPolicy { policy_name, .. } if policy_name.trim().is_empty() => Err("policyName must not be empty".to_string()),
			_ => Ok(()),
		}
	}
}

/// E.164-ish: optional leading `+`, then 4 to 15 digits.
fn validate_phone_number(number: &str) -> Result<(), String> {
	let digits = number.strip_prefix('+').unwrap_or(number);
	if (4..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()) {
		Ok(())
	} else {
		Err(format!("phoneNumber `{number}` is not a valid E.164 number"))
	}
}
