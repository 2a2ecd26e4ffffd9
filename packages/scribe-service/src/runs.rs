//! Read side: the views clients poll.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use scribe_domain::{
	action::{ActionPayload, ActionStatus, ActionType, TargetTable},
	run::{RunStatus, StepKind},
	safety::{self, Disposition, GateItem},
};
use scribe_storage::models::{
	AuditEntry, Clarification, ProposedAction, Run, RunDetail, Step,
};

use crate::{Result, ScribeService};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
	pub run_id: Uuid,
	pub status: RunStatus,
	pub intent_type: String,
	pub patient_id: Option<String>,
	pub encounter_id: Option<String>,
	pub summary: Option<String>,
	pub error_message: Option<String>,
	pub rejection_reason: Option<String>,
	pub input_tokens: i64,
	pub output_tokens: i64,
	#[serde(with = "crate::time_serde")]
	pub created_at: OffsetDateTime,
	#[serde(with = "crate::time_serde")]
	pub updated_at: OffsetDateTime,
	/// Present only while the run is in a transient status.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub poll_after_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
	pub seq: i32,
	pub kind: StepKind,
	pub tool_name: Option<String>,
	pub text: Option<String>,
	pub input_tokens: i64,
	pub output_tokens: i64,
	#[serde(with = "crate::time_serde")]
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationView {
	pub clarification_id: Uuid,
	pub question: String,
	pub options: Vec<String>,
	pub answer: Option<String>,
	#[serde(with = "crate::time_serde::option")]
	pub answered_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionView {
	pub action_id: Uuid,
	pub action_type: ActionType,
	pub action_group: Uuid,
	pub payload: Value,
	pub provider_modified_payload: Option<Value>,
	pub status: ActionStatus,
	pub assumptions: Vec<String>,
	pub confidence_score: Option<f64>,
	/// Safety-gated items of the payload a commit would apply, e.g. `diagnosis:F33.1`.
	pub gate_items: Vec<String>,
	pub dispositions: Vec<Disposition>,
	pub missing_dispositions: Vec<String>,
	pub revision: i32,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntryView {
	pub audit_id: Uuid,
	pub action_id: Uuid,
	pub actor_id: String,
	pub target_table: TargetTable,
	pub record_id: Uuid,
	pub operation: String,
	#[serde(with = "crate::time_serde")]
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetailView {
	pub run: RunView,
	pub steps: Vec<StepView>,
	pub clarifications: Vec<ClarificationView>,
	pub actions: Vec<ActionView>,
}

/// What a client needs after driving a run: its status plus the next thing to act on.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
	pub run_id: Uuid,
	pub status: RunStatus,
	/// False when an idempotent replay returned an existing run.
	pub created: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub summary: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub poll_after_ms: Option<u64>,
	/// Unanswered questions, when the run waits on them.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub clarifications: Option<Vec<ClarificationView>>,
	/// Staged actions, when the run waits on review.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub proposed_actions: Option<Vec<ActionView>>,
}

impl ScribeService {
	pub async fn get_run(&self, org_id: &str, run_id: Uuid) -> Result<RunDetailView> {
		let detail = self.store.run_detail(org_id, run_id).await?;

		Ok(RunDetailView {
			run: self.run_view(&detail.run),
			steps: detail.steps.iter().map(step_view).collect(),
			clarifications: detail.clarifications.iter().map(clarification_view).collect(),
			actions: detail.actions.iter().map(action_view).collect(),
		})
	}

	pub async fn audit_trail(&self, org_id: &str, run_id: Uuid) -> Result<Vec<AuditEntryView>> {
		let entries = self.store.audit_entries(org_id, run_id).await?;

		Ok(entries.iter().map(audit_view).collect())
	}

	pub(crate) async fn outcome(&self, org_id: &str, run_id: Uuid, created: bool) -> Result<RunOutcome> {
		let detail = self.store.run_detail(org_id, run_id).await?;

		Ok(self.outcome_from(&detail, created))
	}

	pub(crate) fn outcome_from(&self, detail: &RunDetail, created: bool) -> RunOutcome {
		let run = &detail.run;
		let clarifications = (run.status == RunStatus::NeedsClarification).then(|| {
			detail
				.clarifications
				.iter()
				.filter(|clarification| clarification.answer.is_none())
				.map(clarification_view)
				.collect()
		});
		let proposed_actions = (run.status == RunStatus::ReadyToCommit)
			.then(|| detail.actions.iter().map(action_view).collect());

		RunOutcome {
			run_id: run.id,
			status: run.status,
			created,
			summary: run.summary.clone(),
			error_message: run.error_message.clone(),
			poll_after_ms: self.poll_after(run.status),
			clarifications,
			proposed_actions,
		}
	}

	pub(crate) fn run_view(&self, run: &Run) -> RunView {
		RunView {
			run_id: run.id,
			status: run.status,
			intent_type: run.intent_type.clone(),
			patient_id: run.patient_id.clone(),
			encounter_id: run.encounter_id.clone(),
			summary: run.summary.clone(),
			error_message: run.error_message.clone(),
			rejection_reason: run.rejection_reason.clone(),
			input_tokens: run.input_tokens,
			output_tokens: run.output_tokens,
			created_at: run.created_at,
			updated_at: run.updated_at,
			poll_after_ms: self.poll_after(run.status),
		}
	}

	fn poll_after(&self, status: RunStatus) -> Option<u64> {
		(!status.is_stable()).then_some(self.cfg.agent.poll_interval_ms)
	}
}

pub(crate) fn action_view(action: &ProposedAction) -> ActionView {
	let reviewed = reviewed_payload(action).ok();
	let gate_items = reviewed
		.as_ref()
		.map(|(_, items)| items.iter().map(GateItem::key).collect())
		.unwrap_or_default();
	let missing_dispositions = reviewed
		.as_ref()
		.map(|(_, items)| {
			safety::missing_dispositions(items, &action.dispositions)
				.iter()
				.map(GateItem::key)
				.collect()
		})
		.unwrap_or_default();

	ActionView {
		action_id: action.id,
		action_type: action.action_type,
		action_group: action.action_group,
		payload: action.payload.clone(),
		provider_modified_payload: action.provider_modified_payload.clone(),
		status: action.status,
		assumptions: action.assumptions.clone(),
		confidence_score: action.confidence_score,
		gate_items,
		dispositions: action.dispositions.clone(),
		missing_dispositions,
		revision: action.revision,
	}
}

/// Parses an action for review: the payload a commit would apply, and the gate items drawn from
/// the drafted payload and the reviewer's replacement together.
pub(crate) fn reviewed_payload(action: &ProposedAction) -> Result<(ActionPayload, Vec<GateItem>)> {
	let drafted = ActionPayload::from_value(action.action_type, &action.payload)?;
	let edited = action
		.provider_modified_payload
		.as_ref()
		.map(|payload| ActionPayload::from_value(action.action_type, payload))
		.transpose()?;
	let items = safety::action_gate_items(&drafted, edited.as_ref());

	Ok((edited.unwrap_or(drafted), items))
}

pub(crate) fn clarification_view(clarification: &Clarification) -> ClarificationView {
	ClarificationView {
		clarification_id: clarification.id,
		question: clarification.question.clone(),
		options: clarification.options.clone(),
		answer: clarification.answer.clone(),
		answered_at: clarification.answered_at,
	}
}

fn step_view(step: &Step) -> StepView {
	StepView {
		seq: step.seq,
		kind: step.kind,
		tool_name: step.tool_name.clone(),
		text: step.text.clone(),
		input_tokens: step.input_tokens,
		output_tokens: step.output_tokens,
		created_at: step.created_at,
	}
}

fn audit_view(entry: &AuditEntry) -> AuditEntryView {
	AuditEntryView {
		audit_id: entry.id,
		action_id: entry.action_id,
		actor_id: entry.actor_id.clone(),
		target_table: entry.target_table,
		record_id: entry.record_id,
		operation: entry.operation.clone(),
		created_at: entry.created_at,
	}
}
