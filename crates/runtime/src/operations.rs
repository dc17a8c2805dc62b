//! Script rendering for the operation catalogue.
//!
//! Every operation becomes one line of PowerShell that evaluates an
//! expression, prints its JSON between the command's sentinels, or prints
//! the failure marker with the exception message.

use serde_json::Value;
use tenantshell_protocol::Operation;
use tracing::warn;
use uuid::Uuid;

use crate::dispatcher::Command;
use crate::error::Result;
use crate::parser::Sentinels;
use crate::session::SessionHandle;

/// Depth passed to `ConvertTo-Json`; the default of 2 truncates policy objects.
const JSON_DEPTH: u8 = 6;

const USER_PROPERTIES: &str = "Identity, UserPrincipalName, DisplayName, LineUri, EnterpriseVoiceEnabled, \
	OnlineVoiceRoutingPolicy, TenantDialPlan, TeamsCallingPolicy, TeamsEmergencyCallingPolicy";

const NUMBER_PROPERTIES: &str = "TelephoneNumber, NumberType, ActivationState, AssignedPstnTargetId, PstnAssignmentStatus, City";

/// Quotes `value` as a PowerShell single-quoted literal.
///
/// PowerShell treats the typographic single quotes as quote characters too,
/// so all of them are doubled.
pub fn quote(value: &str) -> String {
	let mut quoted = String::with_capacity(value.len() + 2);
	quoted.push('\'');
	for ch in value.chars() {
		if matches!(ch, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
			quoted.push(ch);
		}
		quoted.push(ch);
	}
	quoted.push('\'');
	quoted
}

/// Wraps `expression` so its value is printed between fresh sentinels.
pub fn structured(expression: &str) -> Command {
	let tag = Uuid::new_v4().simple().to_string();
	let sentinels = Sentinels::for_tag(&tag);
	let script = format!(
		"try {{ $tsResult = {expression}; Write-Output {begin}; ConvertTo-Json -InputObject $tsResult -Depth {JSON_DEPTH} -Compress; Write-Output {end} }} \
		 catch {{ Write-Output ({fail} + ' ' + ($_.Exception.Message -replace '\\s+', ' ')) }}",
		begin = quote(&sentinels.begin),
		end = quote(&sentinels.end),
		fail = quote(&sentinels.fail),
	);
	Command::structured(script, sentinels)
}

/// The PowerShell expression evaluated for `op`.
pub fn render(op: &Operation) -> String {
	match op {
		Operation::GetUser { identity } => user_expression(identity),
		Operation::ListPhoneNumbers { filter } => match filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
			Some(filter) => format!(
				"@(Get-CsPhoneNumberAssignment -TelephoneNumberContain {} | Select-Object {NUMBER_PROPERTIES})",
				quote(filter)
			),
			None => format!("@(Get-CsPhoneNumberAssignment | Select-Object {NUMBER_PROPERTIES})"),
		},
		Operation::AssignPhoneNumber {
			identity,
			phone_number,
			number_type,
		} => applied(&format!(
			"Set-CsPhoneNumberAssignment -Identity {} -PhoneNumber {} -PhoneNumberType {}",
			quote(identity),
			quote(phone_number),
			number_type.as_str()
		)),
		Operation::UnassignPhoneNumber {
			identity,
			phone_number,
			number_type,
		} => applied(&format!(
			"Remove-CsPhoneNumberAssignment -Identity {} -PhoneNumber {} -PhoneNumberType {}",
			quote(identity),
			quote(phone_number),
			number_type.as_str()
		)),
		Operation::GrantPolicy {
			identity,
			policy_type,
			policy_name,
		} => applied(&format!(
			"Grant-Cs{} -Identity {} -PolicyName {}",
			policy_type.as_str(),
			quote(identity),
			quote(policy_name)
		)),
	}
}

fn user_expression(identity: &str) -> String {
	format!("Get-CsOnlineUser -Identity {} | Select-Object {USER_PROPERTIES}", quote(identity))
}

/// Runs a cmdlet with no useful output and yields a small confirmation object.
fn applied(cmdlet: &str) -> String {
	format!("& {{ {cmdlet} | Out-Null; [pscustomobject]@{{ Applied = $true }} }}")
}

/// Result of a high-level operation plus the snapshots taken around it.
#[derive(Debug)]
pub struct OperationOutcome {
	pub result: Result<Value>,
	pub before: Option<Value>,
	pub after: Option<Value>,
}

/// Runs `op` on a connected session.
///
/// Mutating operations read the target user before and after the change.
/// When the first read fails the change is not attempted. Operations on
/// one session run one at a time, so no other operation's commands land
/// between the reads and the change.
pub async fn execute(session: &SessionHandle, op: &Operation) -> OperationOutcome {
	let _exclusive = session.exclusive().await;
	let identity = match op.target_identity() {
		Some(identity) if op.is_mutating() => identity,
		_ => {
			return OperationOutcome {
				result: session.run(structured(&render(op))).await,
				before: None,
				after: None,
			};
		}
	};

	let before = match session.run(structured(&user_expression(identity))).await {
		Ok(before) => before,
		Err(e) => {
			return OperationOutcome {
				result: Err(e),
				before: None,
				after: None,
			};
		}
	};

	let result = session.run(structured(&render(op))).await;
	let after = match &result {
		Ok(_) => match session.run(structured(&user_expression(identity))).await {
			Ok(after) => Some(after),
			Err(e) => {
				warn!(
					target = "tenantshell.session",
					session = %session.id(),
					operation = op.name(),
					error = %e,
					"could not read state after change"
				);
				None
			}
		},
		Err(_) => None,
	};

	OperationOutcome {
		result,
		before: Some(before),
		after,
	}
}
