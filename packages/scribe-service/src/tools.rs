//! The closed tool catalog offered to the reasoning model.
//!
//! Every tool the model may call is a [`Tool`] variant. Arguments are parsed into an
//! [`Invocation`] before anything runs, so an unknown tool or a malformed argument object fails
//! the run instead of being skipped.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{Map, Value};

use scribe_domain::{
	action::{ActionPayload, ActionType},
	run::StepKind,
};
use scribe_providers::reasoner::ToolSpec;
use scribe_storage::models::{NewClarification, Step};

use crate::{Error, Result};

const ASSUMPTIONS_ARG: &str = "assumptions";
const CONFIDENCE_ARG: &str = "confidence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
	GetPatientContext,
	Draft(ActionType),
	AskClarification,
	SubmitResults,
}
impl Tool {
	pub const ALL: [Self; 10] = [
		Self::GetPatientContext,
		Self::Draft(ActionType::NoteDraft),
		Self::Draft(ActionType::EncounterCreation),
		Self::Draft(ActionType::MedicationChange),
		Self::Draft(ActionType::Appointment),
		Self::Draft(ActionType::BillingSuggestion),
		Self::Draft(ActionType::UtilizationReview),
		Self::Draft(ActionType::TreatmentPlan),
		Self::AskClarification,
		Self::SubmitResults,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::GetPatientContext => "get_patient_context",
			Self::Draft(ActionType::NoteDraft) => "draft_progress_note",
			Self::Draft(ActionType::EncounterCreation) => "draft_encounter",
			Self::Draft(ActionType::MedicationChange) => "draft_medication_change",
			Self::Draft(ActionType::Appointment) => "draft_appointment",
			Self::Draft(ActionType::BillingSuggestion) => "suggest_billing",
			Self::Draft(ActionType::UtilizationReview) => "draft_utilization_review",
			Self::Draft(ActionType::TreatmentPlan) => "draft_treatment_plan",
			Self::AskClarification => "ask_clarification",
			Self::SubmitResults => "submit_results",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|tool| tool.name() == name)
	}

	fn description(self) -> &'static str {
		match self {
			Self::GetPatientContext =>
				"Read the patient's recently committed records and the request's patient and encounter ids.",
			Self::Draft(ActionType::NoteDraft) =>
				"Draft a progress note. Include diagnoses and risk_flags when the session supports them.",
			Self::Draft(ActionType::EncounterCreation) => "Draft a new encounter record.",
			Self::Draft(ActionType::MedicationChange) =>
				"Draft a medication start, stop, or dose adjustment.",
			Self::Draft(ActionType::Appointment) => "Draft an appointment.",
			Self::Draft(ActionType::BillingSuggestion) =>
				"Suggest a CPT code with supporting diagnosis codes.",
			Self::Draft(ActionType::UtilizationReview) => "Draft a utilization review request.",
			Self::Draft(ActionType::TreatmentPlan) => "Draft a treatment plan.",
			Self::AskClarification =>
				"Ask the clinician one or more questions. The run pauses until every question is answered.",
			Self::SubmitResults =>
				"Finish. Stage every draft for review, optionally bundled into groups of draft ids that must commit together.",
		}
	}

	fn parameters(self) -> Value {
		let draft_extras = |mut schema: Value| {
			if let Some(props) = schema.get_mut("properties").and_then(Value::as_object_mut) {
				props.insert(
					ASSUMPTIONS_ARG.to_string(),
					serde_json::json!({ "type": "array", "items": { "type": "string" } }),
				);
				props.insert(
					CONFIDENCE_ARG.to_string(),
					serde_json::json!({ "type": "number", "minimum": 0, "maximum": 1 }),
				);
			}

			schema
		};
		let diagnoses = serde_json::json!({
			"type": "array",
			"items": {
				"type": "object",
				"properties": { "code": { "type": "string" }, "description": { "type": "string" } },
				"required": ["code"],
			},
		});
		let strings = serde_json::json!({ "type": "array", "items": { "type": "string" } });

		match self {
			Self::GetPatientContext => serde_json::json!({ "type": "object", "properties": {} }),
			Self::Draft(ActionType::NoteDraft) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"format": { "type": "string", "enum": ["soap", "dap", "birp"] },
					"session_date": { "type": "string" },
					"duration_minutes": { "type": "integer" },
					"sections": {
						"type": "array",
						"items": {
							"type": "object",
							"properties": {
								"heading": { "type": "string" },
								"body": { "type": "string" },
							},
							"required": ["heading", "body"],
						},
					},
					"diagnoses": diagnoses,
					"risk_flags": strings,
				},
				"required": ["format", "sections"],
			})),
			Self::Draft(ActionType::EncounterCreation) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"encounter_date": { "type": "string" },
					"encounter_type": { "type": "string" },
					"duration_minutes": { "type": "integer" },
					"location": { "type": "string" },
				},
				"required": ["encounter_date", "encounter_type"],
			})),
			Self::Draft(ActionType::MedicationChange) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"medication": { "type": "string" },
					"change": { "type": "string", "enum": ["start", "stop", "adjust"] },
					"dose": { "type": "string" },
					"frequency": { "type": "string" },
					"rationale": { "type": "string" },
				},
				"required": ["medication", "change", "rationale"],
			})),
			Self::Draft(ActionType::Appointment) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"starts_at": { "type": "string" },
					"duration_minutes": { "type": "integer" },
					"appointment_type": { "type": "string" },
					"notes": { "type": "string" },
				},
				"required": ["starts_at", "duration_minutes", "appointment_type"],
			})),
			Self::Draft(ActionType::BillingSuggestion) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"cpt_code": { "type": "string" },
					"modifiers": strings,
					"units": { "type": "integer" },
					"diagnosis_codes": strings,
					"rationale": { "type": "string" },
				},
				"required": ["cpt_code", "rationale"],
			})),
			Self::Draft(ActionType::UtilizationReview) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"payer": { "type": "string" },
					"level_of_care": { "type": "string" },
					"justification": { "type": "string" },
					"requested_sessions": { "type": "integer" },
				},
				"required": ["level_of_care", "justification"],
			})),
			Self::Draft(ActionType::TreatmentPlan) => draft_extras(serde_json::json!({
				"type": "object",
				"properties": {
					"problems": strings,
					"goals": {
						"type": "array",
						"items": {
							"type": "object",
							"properties": {
								"description": { "type": "string" },
								"target_date": { "type": "string" },
							},
							"required": ["description"],
						},
					},
					"interventions": strings,
					"diagnoses": diagnoses,
				},
				"required": ["problems", "goals"],
			})),
			Self::AskClarification => serde_json::json!({
				"type": "object",
				"properties": {
					"questions": {
						"type": "array",
						"items": {
							"type": "object",
							"properties": {
								"question": { "type": "string" },
								"options": strings,
							},
							"required": ["question"],
						},
					},
				},
				"required": ["questions"],
			}),
			Self::SubmitResults => serde_json::json!({
				"type": "object",
				"properties": {
					"summary": { "type": "string" },
					"groups": { "type": "array", "items": strings },
				},
				"required": ["summary"],
			}),
		}
	}
}

/// A drafted edit, waiting for `submit_results`.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
	pub payload: ActionPayload,
	pub assumptions: Vec<String>,
	pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
	PatientContext,
	Draft(Draft),
	AskClarification(Vec<NewClarification>),
	Submit { summary: String, groups: Vec<Vec<String>> },
}

#[derive(Deserialize)]
struct ClarificationArgs {
	questions: Vec<QuestionArg>,
}

#[derive(Deserialize)]
struct QuestionArg {
	question: String,
	#[serde(default)]
	options: Vec<String>,
}

#[derive(Deserialize)]
struct SubmitArgs {
	summary: String,
	#[serde(default)]
	groups: Vec<Vec<String>>,
}

pub fn catalog() -> Vec<ToolSpec> {
	Tool::ALL
		.into_iter()
		.map(|tool| ToolSpec {
			name: tool.name(),
			description: tool.description(),
			parameters: tool.parameters(),
		})
		.collect()
}

/// Parses the model's arguments for `tool`. Errors are collaborator failures.
pub fn parse(tool: Tool, args: &Value, max_clarifications: usize) -> Result<Invocation> {
	match tool {
		Tool::GetPatientContext => Ok(Invocation::PatientContext),
		Tool::Draft(action_type) => parse_draft(action_type, args).map(Invocation::Draft),
		Tool::AskClarification => {
			let parsed: ClarificationArgs = decode(tool, args)?;

			if parsed.questions.is_empty() || parsed.questions.len() > max_clarifications {
				return Err(malformed(
					tool,
					&format!("between 1 and {max_clarifications} questions are required"),
				));
			}

			let mut questions = Vec::with_capacity(parsed.questions.len());

			for arg in parsed.questions {
				let question = arg.question.trim();

				if question.is_empty() {
					return Err(malformed(tool, "questions must be non-empty"));
				}

				let mut seen = BTreeSet::new();
				let options = arg
					.options
					.iter()
					.map(|option| option.trim())
					.filter(|option| !option.is_empty() && seen.insert(option.to_lowercase()))
					.map(ToString::to_string)
					.collect();

				questions.push(NewClarification { question: question.to_string(), options });
			}

			Ok(Invocation::AskClarification(questions))
		},
		Tool::SubmitResults => {
			let parsed: SubmitArgs = decode(tool, args)?;
			let summary = parsed.summary.trim();

			if summary.is_empty() {
				return Err(malformed(tool, "summary must be non-empty"));
			}

			Ok(Invocation::Submit { summary: summary.to_string(), groups: parsed.groups })
		},
	}
}

fn parse_draft(action_type: ActionType, args: &Value) -> Result<Draft> {
	let tool = Tool::Draft(action_type);
	let mut fields: Map<String, Value> =
		args.as_object().cloned().ok_or_else(|| malformed(tool, "arguments must be an object"))?;
	let assumptions = match fields.remove(ASSUMPTIONS_ARG) {
		None | Some(Value::Null) => Vec::new(),
		Some(raw) => serde_json::from_value::<Vec<String>>(raw)
			.map_err(|_| malformed(tool, "assumptions must be a list of strings"))?
			.into_iter()
			.map(|assumption| assumption.trim().to_string())
			.filter(|assumption| !assumption.is_empty())
			.collect(),
	};
	let confidence = match fields.remove(CONFIDENCE_ARG) {
		None | Some(Value::Null) => None,
		Some(raw) => match raw.as_f64() {
			Some(score) if (0.0..=1.0).contains(&score) => Some(score),
			_ => return Err(malformed(tool, "confidence must be a number between 0 and 1")),
		},
	};
	let payload = ActionPayload::from_value(action_type, &Value::Object(fields))
		.map_err(|err| malformed(tool, &err.to_string()))?;

	Ok(Draft { payload, assumptions, confidence })
}

/// Drafts recorded so far in a run, in the order they were made.
pub fn drafts_from_steps(steps: &[Step]) -> Vec<(String, Draft)> {
	steps
		.iter()
		.filter(|step| step.kind == StepKind::Tool)
		.filter_map(|step| {
			let Some(Tool::Draft(action_type)) = step.tool_name.as_deref().and_then(Tool::from_name)
			else {
				return None;
			};
			let draft_id = step.tool_output.as_ref()?.get("draft_id")?.as_str()?.to_string();
			let draft = parse_draft(action_type, step.tool_input.as_ref()?).ok()?;

			Some((draft_id, draft))
		})
		.collect()
}

pub fn next_draft_id(existing: usize) -> String {
	format!("draft_{}", existing + 1)
}

/// Splits drafts into commit groups. With no groups every draft lands in one group; drafts the
/// model left out of its groups are bundled into a trailing group.
pub fn group_drafts(
	drafts: Vec<(String, Draft)>,
	groups: &[Vec<String>],
) -> Result<Vec<Vec<Draft>>> {
	if drafts.is_empty() {
		return Ok(Vec::new());
	}
	if groups.iter().all(Vec::is_empty) {
		return Ok(vec![drafts.into_iter().map(|(_, draft)| draft).collect()]);
	}

	let mut pool: BTreeMap<String, Draft> = BTreeMap::new();
	let order: Vec<String> = drafts.iter().map(|(id, _)| id.clone()).collect();

	for (id, draft) in drafts {
		pool.insert(id, draft);
	}

	let mut grouped = Vec::new();

	for group in groups.iter().filter(|group| !group.is_empty()) {
		let mut members = Vec::with_capacity(group.len());

		for id in group {
			let Some(draft) = pool.remove(id.trim()) else {
				return Err(malformed(
					Tool::SubmitResults,
					&format!("group member {id} is unknown or already grouped"),
				));
			};

			members.push(draft);
		}

		grouped.push(members);
	}

	let leftover: Vec<Draft> = order.iter().filter_map(|id| pool.remove(id)).collect();

	if !leftover.is_empty() {
		grouped.push(leftover);
	}

	Ok(grouped)
}

fn decode<T>(tool: Tool, args: &Value) -> Result<T>
where
	T: for<'de> Deserialize<'de>,
{
	T::deserialize(args).map_err(|err| malformed(tool, &err.to_string()))
}

fn malformed(tool: Tool, message: &str) -> Error {
	Error::Provider { message: format!("Malformed arguments for {}: {message}.", tool.name()) }
}
