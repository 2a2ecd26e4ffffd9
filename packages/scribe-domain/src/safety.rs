//! Clinical safety gate.
//!
//! Diagnosis-bearing actions and notes that carry risk flags cannot be committed until a human
//! reviewer has recorded a disposition for every gated item. The commit engine checks this as a
//! precondition; it is not advisory metadata.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::{
	Error, Result,
	action::{ActionPayload, DiagnosisSuggestion},
};

const DIAGNOSIS_PREFIX: &str = "diagnosis:";
const RISK_PREFIX: &str = "risk:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GateItem {
	Diagnosis { code: String },
	RiskFlag { flag: String },
}
impl GateItem {
	/// Stable key used to match a disposition to its item, e.g. `diagnosis:F33.1`.
	pub fn key(&self) -> String {
		match self {
			Self::Diagnosis { code } => format!("{DIAGNOSIS_PREFIX}{}", normalize_code(code)),
			Self::RiskFlag { flag } => format!("{RISK_PREFIX}{}", normalize_flag(flag)),
		}
	}

	pub fn parse_key(key: &str) -> Option<Self> {
		if let Some(code) = key.strip_prefix(DIAGNOSIS_PREFIX)
			&& !code.trim().is_empty()
		{
			return Some(Self::Diagnosis { code: normalize_code(code) });
		}
		if let Some(flag) = key.strip_prefix(RISK_PREFIX)
			&& !flag.trim().is_empty()
		{
			return Some(Self::RiskFlag { flag: normalize_flag(flag) });
		}

		None
	}
}
impl fmt::Display for GateItem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.key())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
	Accept,
	Adjust,
	Defer,
	Acknowledge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disposition {
	pub item: String,
	pub decision: Decision,
	/// Rows written before the camelCase rename still carry `adjusted_code`.
	#[serde(default, alias = "adjusted_code", skip_serializing_if = "Option::is_none")]
	pub adjusted_code: Option<String>,
}
impl Disposition {
	/// Checks the decision against the kind of item it is recorded for.
	pub fn validate(&self) -> Result<GateItem> {
		let invalid =
			|message: &str| Error::InvalidDisposition { item: self.item.clone(), message: message.to_string() };
		let item = GateItem::parse_key(&self.item).ok_or_else(|| invalid("unknown gate item."))?;

		match (&item, self.decision) {
			(GateItem::Diagnosis { .. }, Decision::Accept | Decision::Defer) => {
				if self.adjusted_code.is_some() {
					return Err(invalid("adjustedCode is only valid with adjust."));
				}
			},
			(GateItem::Diagnosis { .. }, Decision::Adjust) => {
				if self.adjusted_code.as_deref().map(|code| code.trim().is_empty()).unwrap_or(true) {
					return Err(invalid("adjust requires adjustedCode."));
				}
			},
			(GateItem::Diagnosis { .. }, Decision::Acknowledge) =>
				return Err(invalid("diagnoses must be accepted, adjusted, or deferred.")),
			(GateItem::RiskFlag { .. }, Decision::Acknowledge) => {},
			(GateItem::RiskFlag { .. }, _) =>
				return Err(invalid("risk flags can only be acknowledged.")),
		}

		Ok(item)
	}
}

/// Items in a payload that need a recorded disposition before commit.
pub fn gate_items(payload: &ActionPayload) -> Vec<GateItem> {
	let mut items = BTreeSet::new();

	match payload {
		ActionPayload::NoteDraft(note) => {
			insert_diagnoses(&mut items, note.diagnoses.iter().map(|d| d.code.as_str()));

			for flag in &note.risk_flags {
				items.insert(GateItem::RiskFlag { flag: normalize_flag(flag) });
			}
		},
		ActionPayload::TreatmentPlan(plan) =>
			insert_diagnoses(&mut items, plan.diagnoses.iter().map(|d| d.code.as_str())),
		ActionPayload::BillingSuggestion(billing) =>
			insert_diagnoses(&mut items, billing.diagnosis_codes.iter().map(String::as_str)),
		ActionPayload::EncounterCreation(_)
		| ActionPayload::MedicationChange(_)
		| ActionPayload::Appointment(_)
		| ActionPayload::UtilizationReview(_) => {},
	}

	items.into_iter().collect()
}

/// Gate items of an action across its drafted payload and the reviewer's replacement, if any.
/// Leaving an item out of an edit does not take it off the gate.
pub fn action_gate_items(drafted: &ActionPayload, edited: Option<&ActionPayload>) -> Vec<GateItem> {
	let mut items: BTreeSet<GateItem> = gate_items(drafted).into_iter().collect();

	if let Some(edited) = edited {
		items.extend(gate_items(edited));
	}

	items.into_iter().collect()
}

/// Items among `items` that have no matching disposition.
pub fn missing_dispositions(items: &[GateItem], dispositions: &[Disposition]) -> Vec<GateItem> {
	let recorded: BTreeSet<String> = dispositions
		.iter()
		.filter_map(|disposition| disposition.validate().ok())
		.map(|item| item.key())
		.collect();

	items.iter().filter(|item| !recorded.contains(&item.key())).cloned().collect()
}

/// Produces the payload that is written on commit: adjusted diagnoses take their new code and
/// deferred diagnoses are left out of the record.
pub fn apply_dispositions(payload: &ActionPayload, dispositions: &[Disposition]) -> ActionPayload {
	let decided = |code: &str| {
		let key = GateItem::Diagnosis { code: normalize_code(code) }.key();

		dispositions.iter().find(|disposition| disposition.item == key)
	};
	let resolve = |diagnoses: &[DiagnosisSuggestion]| -> Vec<DiagnosisSuggestion> {
		diagnoses
			.iter()
			.filter_map(|diagnosis| match decided(&diagnosis.code) {
				Some(Disposition { decision: Decision::Defer, .. }) => None,
				Some(Disposition { decision: Decision::Adjust, adjusted_code: Some(code), .. }) =>
					Some(DiagnosisSuggestion {
						code: normalize_code(code),
						description: diagnosis.description.clone(),
					}),
				_ => Some(diagnosis.clone()),
			})
			.collect()
	};
	let mut applied = payload.clone();

	match &mut applied {
		ActionPayload::NoteDraft(note) => note.diagnoses = resolve(&note.diagnoses),
		ActionPayload::TreatmentPlan(plan) => plan.diagnoses = resolve(&plan.diagnoses),
		ActionPayload::BillingSuggestion(billing) => {
			billing.diagnosis_codes = billing
				.diagnosis_codes
				.iter()
				.filter_map(|code| match decided(code) {
					Some(Disposition { decision: Decision::Defer, .. }) => None,
					Some(Disposition {
						decision: Decision::Adjust, adjusted_code: Some(adjusted), ..
					}) => Some(normalize_code(adjusted)),
					_ => Some(code.clone()),
				})
				.collect();
		},
		ActionPayload::EncounterCreation(_)
		| ActionPayload::MedicationChange(_)
		| ActionPayload::Appointment(_)
		| ActionPayload::UtilizationReview(_) => {},
	}

	applied
}

fn insert_diagnoses<'a>(items: &mut BTreeSet<GateItem>, codes: impl Iterator<Item = &'a str>) {
	for code in codes {
		items.insert(GateItem::Diagnosis { code: normalize_code(code) });
	}
}

fn normalize_code(code: &str) -> String {
	code.trim().to_ascii_uppercase()
}

fn normalize_flag(flag: &str) -> String {
	flag.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}
