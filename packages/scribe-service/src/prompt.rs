use serde_json::Value;

use scribe_config::Config;
use scribe_domain::{intent::Classification, run::StepKind};
use scribe_providers::reasoner::Turn;
use scribe_storage::models::{Clarification, Run, Step};

use crate::tools::Tool;

const CONTINUE_PROMPT: &str =
	"Continue by calling exactly one tool. Call submit_results when every draft is ready.";

const ANSWERED_THROUGH_KEY: &str = "answered_through";

const SYSTEM_PROMPT: &str = "You are a clinical documentation assistant for a behavioral-health practice. \
Turn the clinician's request into drafted edits to the medical record using the tools provided. \
Call exactly one tool per turn. \
Use get_patient_context before drafting when earlier records could matter. \
Never invent diagnoses, medications, doses, or dates the clinician did not state or the context does not support; ask with ask_clarification instead. \
Put every guess you still had to make into the draft's assumptions. \
Record any risk of harm mentioned in the request as a risk flag on the note. \
Nothing you draft is applied until a clinician reviews and commits it. \
Finish with submit_results.";

pub(crate) fn opening_turns(cfg: &Config, run: &Run, classification: &Classification) -> Vec<Turn> {
	vec![
		Turn::System { content: system_prompt(cfg) },
		Turn::User { content: request_prompt(run, classification) },
	]
}

/// Rebuilds the turns that followed the opening ones from the run's recorded steps.
pub(crate) fn replay(steps: &[Step]) -> Vec<Turn> {
	let mut turns = Vec::new();

	for step in steps {
		match step.kind {
			StepKind::Tool => {
				let (Some(name), Some(call_id)) = (step.tool_name.as_ref(), step.call_id.as_ref())
				else {
					continue;
				};

				turns.push(Turn::ToolCall {
					call_id: call_id.clone(),
					name: name.clone(),
					arguments: step.tool_input.clone().unwrap_or(Value::Object(Default::default())),
				});
				turns.push(Turn::ToolResult {
					call_id: call_id.clone(),
					content: step.tool_output.clone().unwrap_or(Value::Null),
				});
			},
			StepKind::Reasoning => {
				if let Some(text) = step.text.as_ref() {
					turns.push(Turn::Assistant { content: text.clone() });
				}

				turns.push(continue_turn());
			},
			StepKind::ClarificationAnswers =>
				if let Some(text) = step.text.as_ref() {
					turns.push(Turn::User { content: text.clone() });
				},
			StepKind::Error | StepKind::Rejection => {},
		}
	}

	turns
}

pub(crate) fn continue_turn() -> Turn {
	Turn::User { content: CONTINUE_PROMPT.to_string() }
}

pub(crate) struct AnswersSummary {
	pub text: String,
	/// Highest clarification `seq` the summary covers.
	pub answered_through: i32,
}

/// The synthetic turn that resumes a run once every question has an answer. Only questions
/// asked since the previous answers turn are listed; earlier ones are already in the replay.
pub(crate) fn answers_summary(clarifications: &[Clarification], steps: &[Step]) -> AnswersSummary {
	let covered = steps
		.iter()
		.rev()
		.find(|step| step.kind == StepKind::ClarificationAnswers)
		.and_then(|step| step.tool_output.as_ref())
		.and_then(|output| output.get(ANSWERED_THROUGH_KEY))
		.and_then(Value::as_i64)
		.unwrap_or(0);
	let mut out = String::from("The clinician answered your questions:\n");
	let mut answered_through = i32::try_from(covered).unwrap_or(i32::MAX);

	for clarification in clarifications.iter().filter(|c| i64::from(c.seq) > covered) {
		let answer = clarification.answer.as_deref().unwrap_or("(no answer)");

		out.push_str(&format!("- Q: {}\n  A: {answer}\n", clarification.question));

		answered_through = answered_through.max(clarification.seq);
	}

	out.push_str(CONTINUE_PROMPT);

	AnswersSummary { text: out, answered_through }
}

pub(crate) fn answered_through_marker(answered_through: i32) -> Value {
	serde_json::json!({ ANSWERED_THROUGH_KEY: answered_through })
}

fn system_prompt(cfg: &Config) -> String {
	let mut out = String::new();

	if let Some(preamble) = cfg.agent.system_preamble.as_deref() {
		out.push_str(preamble.trim());
		out.push_str("\n\n");
	}

	out.push_str(SYSTEM_PROMPT);

	if let Some(org) = cfg.organization.as_ref() {
		out.push_str(&format!("\n\nOrganization: {}.", org.name));

		if let Some(specialty) = org.specialty.as_deref() {
			out.push_str(&format!(" Specialty: {specialty}."));
		}
	}

	out.push_str(&format!(
		"\n\nAt most {} clarification questions may be asked at once.",
		cfg.agent.max_clarifications
	));

	out
}

fn request_prompt(run: &Run, classification: &Classification) -> String {
	let hints = serde_json::json!({
		"patient_id": run.patient_id,
		"encounter_id": run.encounter_id,
		"intent": classification.intent,
		"entities": classification.entities,
		"risk_signals": classification.risk_signals,
		"draft_tools": Tool::ALL
			.into_iter()
			.filter(|tool| matches!(tool, Tool::Draft(_)))
			.map(Tool::name)
			.collect::<Vec<_>>(),
	});

	format!("Request:\n{}\n\nContext:\n{hints}", run.input_text)
}
