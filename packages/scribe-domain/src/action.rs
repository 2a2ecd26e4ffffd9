use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
	NoteDraft,
	EncounterCreation,
	MedicationChange,
	Appointment,
	BillingSuggestion,
	UtilizationReview,
	TreatmentPlan,
}
impl ActionType {
	pub const ALL: [Self; 7] = [
		Self::NoteDraft,
		Self::EncounterCreation,
		Self::MedicationChange,
		Self::Appointment,
		Self::BillingSuggestion,
		Self::UtilizationReview,
		Self::TreatmentPlan,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::NoteDraft => "note_draft",
			Self::EncounterCreation => "encounter_creation",
			Self::MedicationChange => "medication_change",
			Self::Appointment => "appointment",
			Self::BillingSuggestion => "billing_suggestion",
			Self::UtilizationReview => "utilization_review",
			Self::TreatmentPlan => "treatment_plan",
		}
	}

	/// Clinical table a committed action of this type is written to.
	pub fn target_table(self) -> TargetTable {
		match self {
			Self::NoteDraft => TargetTable::ClinicalNotes,
			Self::EncounterCreation => TargetTable::Encounters,
			Self::MedicationChange => TargetTable::MedicationOrders,
			Self::Appointment => TargetTable::Appointments,
			Self::BillingSuggestion => TargetTable::BillingSuggestions,
			Self::UtilizationReview => TargetTable::UtilizationReviews,
			Self::TreatmentPlan => TargetTable::TreatmentPlans,
		}
	}

	/// Position of this type in a commit. Lower ranks are written first so rows that others
	/// reference (the encounter) exist before their dependents.
	pub fn write_rank(self) -> u8 {
		match self {
			Self::EncounterCreation => 0,
			Self::NoteDraft => 1,
			Self::TreatmentPlan => 2,
			Self::MedicationChange => 3,
			Self::Appointment => 4,
			Self::BillingSuggestion => 5,
			Self::UtilizationReview => 6,
		}
	}

	/// Whether a committed row of this type is attached to the session's encounter.
	pub fn attaches_to_encounter(self) -> bool {
		matches!(self, Self::NoteDraft | Self::BillingSuggestion | Self::MedicationChange)
	}
}
impl fmt::Display for ActionType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for ActionType {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|action_type| action_type.as_str() == raw)
			.ok_or_else(|| Error::UnknownVariant { kind: "action type", value: raw.to_string() })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
	Pending,
	Committed,
	Rejected,
}
impl ActionStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Committed => "committed",
			Self::Rejected => "rejected",
		}
	}

	/// Committed and rejected actions are final; nothing returns to pending.
	pub fn can_transition_to(self, next: Self) -> bool {
		self == Self::Pending && next != Self::Pending
	}
}
impl fmt::Display for ActionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for ActionStatus {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"pending" => Ok(Self::Pending),
			"committed" => Ok(Self::Committed),
			"rejected" => Ok(Self::Rejected),
			_ => Err(Error::UnknownVariant { kind: "action status", value: raw.to_string() }),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTable {
	Encounters,
	ClinicalNotes,
	MedicationOrders,
	Appointments,
	BillingSuggestions,
	UtilizationReviews,
	TreatmentPlans,
}
impl TargetTable {
	pub const ALL: [Self; 7] = [
		Self::Encounters,
		Self::ClinicalNotes,
		Self::MedicationOrders,
		Self::Appointments,
		Self::BillingSuggestions,
		Self::UtilizationReviews,
		Self::TreatmentPlans,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Encounters => "encounters",
			Self::ClinicalNotes => "clinical_notes",
			Self::MedicationOrders => "medication_orders",
			Self::Appointments => "appointments",
			Self::BillingSuggestions => "billing_suggestions",
			Self::UtilizationReviews => "utilization_reviews",
			Self::TreatmentPlans => "treatment_plans",
		}
	}
}
impl fmt::Display for TargetTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for TargetTable {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|table| table.as_str() == raw)
			.ok_or_else(|| Error::UnknownVariant { kind: "target table", value: raw.to_string() })
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisSuggestion {
	pub code: String,
	#[serde(default)]
	pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSection {
	pub heading: String,
	pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteDraft {
	/// Documentation format, e.g. "soap", "dap", or "birp".
	pub format: String,
	pub session_date: Option<String>,
	pub duration_minutes: Option<u32>,
	pub sections: Vec<NoteSection>,
	#[serde(default)]
	pub diagnoses: Vec<DiagnosisSuggestion>,
	#[serde(default)]
	pub risk_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterCreation {
	pub encounter_date: String,
	pub encounter_type: String,
	pub duration_minutes: Option<u32>,
	pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationChange {
	pub medication: String,
	/// One of "start", "stop", or "adjust".
	pub change: String,
	pub dose: Option<String>,
	pub frequency: Option<String>,
	pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
	pub starts_at: String,
	pub duration_minutes: u32,
	pub appointment_type: String,
	pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSuggestion {
	pub cpt_code: String,
	#[serde(default)]
	pub modifiers: Vec<String>,
	#[serde(default = "default_units")]
	pub units: u32,
	#[serde(default)]
	pub diagnosis_codes: Vec<String>,
	pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationReview {
	pub payer: Option<String>,
	pub level_of_care: String,
	pub justification: String,
	pub requested_sessions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentGoal {
	pub description: String,
	pub target_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlan {
	pub problems: Vec<String>,
	pub goals: Vec<TreatmentGoal>,
	#[serde(default)]
	pub interventions: Vec<String>,
	#[serde(default)]
	pub diagnoses: Vec<DiagnosisSuggestion>,
}

/// Typed payload of a proposed action. Every variant corresponds to exactly one
/// [`ActionType`], so grouping and commit can match on the full set of shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
	NoteDraft(NoteDraft),
	EncounterCreation(EncounterCreation),
	MedicationChange(MedicationChange),
	Appointment(Appointment),
	BillingSuggestion(BillingSuggestion),
	UtilizationReview(UtilizationReview),
	TreatmentPlan(TreatmentPlan),
}
impl ActionPayload {
	pub fn action_type(&self) -> ActionType {
		match self {
			Self::NoteDraft(_) => ActionType::NoteDraft,
			Self::EncounterCreation(_) => ActionType::EncounterCreation,
			Self::MedicationChange(_) => ActionType::MedicationChange,
			Self::Appointment(_) => ActionType::Appointment,
			Self::BillingSuggestion(_) => ActionType::BillingSuggestion,
			Self::UtilizationReview(_) => ActionType::UtilizationReview,
			Self::TreatmentPlan(_) => ActionType::TreatmentPlan,
		}
	}

	/// Parses and validates a JSON payload for the given action type.
	pub fn from_value(action_type: ActionType, value: &Value) -> Result<Self> {
		let payload = match action_type {
			ActionType::NoteDraft => Self::NoteDraft(decode(action_type, value)?),
			ActionType::EncounterCreation => Self::EncounterCreation(decode(action_type, value)?),
			ActionType::MedicationChange => Self::MedicationChange(decode(action_type, value)?),
			ActionType::Appointment => Self::Appointment(decode(action_type, value)?),
			ActionType::BillingSuggestion => Self::BillingSuggestion(decode(action_type, value)?),
			ActionType::UtilizationReview => Self::UtilizationReview(decode(action_type, value)?),
			ActionType::TreatmentPlan => Self::TreatmentPlan(decode(action_type, value)?),
		};

		payload.validate()?;

		Ok(payload)
	}

	pub fn to_value(&self) -> Value {
		let encoded = match self {
			Self::NoteDraft(inner) => serde_json::to_value(inner),
			Self::EncounterCreation(inner) => serde_json::to_value(inner),
			Self::MedicationChange(inner) => serde_json::to_value(inner),
			Self::Appointment(inner) => serde_json::to_value(inner),
			Self::BillingSuggestion(inner) => serde_json::to_value(inner),
			Self::UtilizationReview(inner) => serde_json::to_value(inner),
			Self::TreatmentPlan(inner) => serde_json::to_value(inner),
		};

		// Plain structs with string keys always encode.
		encoded.unwrap_or(Value::Null)
	}

	pub fn validate(&self) -> Result<()> {
		let action_type = self.action_type().as_str();
		let invalid =
			|message: &str| Error::InvalidPayload { action_type, message: message.to_string() };

		match self {
			Self::NoteDraft(note) => {
				require(&note.format, "format", action_type)?;

				if note.sections.is_empty() {
					return Err(invalid("sections must be non-empty."));
				}
				if note.sections.iter().any(|s| s.heading.trim().is_empty() || s.body.trim().is_empty())
				{
					return Err(invalid("every section needs a heading and a body."));
				}

				require_diagnosis_codes(&note.diagnoses, action_type)?;

				if note.risk_flags.iter().any(|flag| flag.trim().is_empty()) {
					return Err(invalid("risk_flags must not contain blank entries."));
				}
			},
			Self::EncounterCreation(encounter) => {
				require(&encounter.encounter_date, "encounter_date", action_type)?;
				require(&encounter.encounter_type, "encounter_type", action_type)?;
			},
			Self::MedicationChange(change) => {
				require(&change.medication, "medication", action_type)?;
				require(&change.rationale, "rationale", action_type)?;

				if !matches!(change.change.as_str(), "start" | "stop" | "adjust") {
					return Err(invalid("change must be one of start, stop, or adjust."));
				}
			},
			Self::Appointment(appointment) => {
				require(&appointment.starts_at, "starts_at", action_type)?;
				require(&appointment.appointment_type, "appointment_type", action_type)?;

				if appointment.duration_minutes == 0 {
					return Err(invalid("duration_minutes must be greater than zero."));
				}
			},
			Self::BillingSuggestion(billing) => {
				require(&billing.cpt_code, "cpt_code", action_type)?;
				require(&billing.rationale, "rationale", action_type)?;

				if billing.units == 0 {
					return Err(invalid("units must be greater than zero."));
				}
				if billing.diagnosis_codes.iter().any(|code| code.trim().is_empty()) {
					return Err(invalid("diagnosis_codes must not contain blank entries."));
				}
			},
			Self::UtilizationReview(review) => {
				require(&review.level_of_care, "level_of_care", action_type)?;
				require(&review.justification, "justification", action_type)?;
			},
			Self::TreatmentPlan(plan) => {
				if plan.problems.is_empty() || plan.goals.is_empty() {
					return Err(invalid("problems and goals must be non-empty."));
				}
				if plan.goals.iter().any(|goal| goal.description.trim().is_empty()) {
					return Err(invalid("every goal needs a description."));
				}

				require_diagnosis_codes(&plan.diagnoses, action_type)?;
			},
		}

		Ok(())
	}
}

fn decode<T>(action_type: ActionType, value: &Value) -> Result<T>
where
	T: DeserializeOwned,
{
	T::deserialize(value).map_err(|err| Error::InvalidPayload {
		action_type: action_type.as_str(),
		message: err.to_string(),
	})
}

fn require(value: &str, field: &str, action_type: &'static str) -> Result<()> {
	if value.trim().is_empty() {
		return Err(Error::InvalidPayload {
			action_type,
			message: format!("{field} must be non-empty."),
		});
	}

	Ok(())
}

fn require_diagnosis_codes(diagnoses: &[DiagnosisSuggestion], action_type: &'static str) -> Result<()> {
	if diagnoses.iter().any(|diagnosis| diagnosis.code.trim().is_empty()) {
		return Err(Error::InvalidPayload {
			action_type,
			message: "every diagnosis needs a code.".to_string(),
		});
	}

	Ok(())
}

fn default_units() -> u32 {
	1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encounter_is_written_before_its_note() {
		let mut types = vec![ActionType::BillingSuggestion, ActionType::NoteDraft, ActionType::EncounterCreation];

		types.sort_by_key(|action_type| action_type.write_rank());

		assert_eq!(
			types,
			vec![ActionType::EncounterCreation, ActionType::NoteDraft, ActionType::BillingSuggestion]
		);
	}

	#[test]
	fn finished_actions_never_return_to_pending() {
		assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Committed));
		assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Rejected));
		assert!(!ActionStatus::Committed.can_transition_to(ActionStatus::Pending));
		assert!(!ActionStatus::Rejected.can_transition_to(ActionStatus::Pending));
		assert!(!ActionStatus::Committed.can_transition_to(ActionStatus::Rejected));
	}

	#[test]
	fn billing_units_default_to_one() {
		let payload = ActionPayload::from_value(
			ActionType::BillingSuggestion,
			&serde_json::json!({ "cpt_code": "90837", "rationale": "60 minute session." }),
		)
		.expect("parse failed");

		let ActionPayload::BillingSuggestion(billing) = payload else {
			panic!("Expected a billing suggestion.");
		};

		assert_eq!(billing.units, 1);
	}

	#[test]
	fn note_without_sections_is_invalid() {
		let err = ActionPayload::from_value(
			ActionType::NoteDraft,
			&serde_json::json!({ "format": "soap", "sections": [] }),
		)
		.expect_err("Empty note must be rejected.");

		assert!(err.to_string().contains("sections must be non-empty"));
	}

	#[test]
	fn medication_change_kind_is_closed() {
		let err = ActionPayload::from_value(
			ActionType::MedicationChange,
			&serde_json::json!({
				"medication": "sertraline",
				"change": "double",
				"rationale": "Partial response.",
			}),
		)
		.expect_err("Unknown change kind must be rejected.");

		assert!(err.to_string().contains("start, stop, or adjust"));
	}
}
