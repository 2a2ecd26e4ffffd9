use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use scribe_domain::{
	action::{ActionStatus, ActionType, TargetTable},
	run::{RunStatus, StepKind},
	safety::Disposition,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
	pub id: Uuid,
	pub org_id: String,
	pub user_id: String,
	pub patient_id: Option<String>,
	pub encounter_id: Option<String>,
	pub idempotency_key: Option<String>,
	/// blake3 hex digest of the normalized input text.
	pub input_fingerprint: String,
	pub input_text: String,
	pub intent_type: String,
	pub status: RunStatus,
	pub error_message: Option<String>,
	pub summary: Option<String>,
	pub rejection_reason: Option<String>,
	pub input_tokens: i64,
	pub output_tokens: i64,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewRun {
	pub org_id: String,
	pub user_id: String,
	pub patient_id: Option<String>,
	pub encounter_id: Option<String>,
	pub idempotency_key: Option<String>,
	pub input_fingerprint: String,
	pub input_text: String,
	pub intent_type: String,
}

#[derive(Debug, Clone)]
pub struct CreateRunOutcome {
	pub run: Run,
	/// False when a live run with the same idempotency key already existed.
	pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
	pub id: Uuid,
	pub run_id: Uuid,
	pub seq: i32,
	pub kind: StepKind,
	pub tool_name: Option<String>,
	pub call_id: Option<String>,
	pub tool_input: Option<Value>,
	pub tool_output: Option<Value>,
	pub text: Option<String>,
	pub input_tokens: i64,
	pub output_tokens: i64,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewStep {
	pub kind: StepKind,
	pub tool_name: Option<String>,
	pub call_id: Option<String>,
	pub tool_input: Option<Value>,
	pub tool_output: Option<Value>,
	pub text: Option<String>,
	pub input_tokens: i64,
	pub output_tokens: i64,
}
impl NewStep {
	pub fn new(kind: StepKind) -> Self {
		Self {
			kind,
			tool_name: None,
			call_id: None,
			tool_input: None,
			tool_output: None,
			text: None,
			input_tokens: 0,
			output_tokens: 0,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clarification {
	pub id: Uuid,
	pub run_id: Uuid,
	pub seq: i32,
	pub question: String,
	pub options: Vec<String>,
	pub answer: Option<String>,
	pub created_at: OffsetDateTime,
	pub answered_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClarification {
	pub question: String,
	pub options: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AnswerOutcome {
	pub run: Run,
	pub clarification: Clarification,
	/// Clarifications of the run that still have no answer.
	pub remaining: Vec<Clarification>,
	/// True when this answer was the last open one and the run moved back to `running`.
	pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAction {
	pub id: Uuid,
	pub run_id: Uuid,
	pub seq: i32,
	pub action_type: ActionType,
	pub action_group: Uuid,
	pub payload: Value,
	pub provider_modified_payload: Option<Value>,
	pub status: ActionStatus,
	pub assumptions: Vec<String>,
	pub confidence_score: Option<f64>,
	pub dispositions: Vec<Disposition>,
	/// Bumped on every reviewer change; commit plans are checked against it.
	pub revision: i32,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}
impl ProposedAction {
	/// The payload a commit would apply.
	pub fn effective_payload(&self) -> &Value {
		self.provider_modified_payload.as_ref().unwrap_or(&self.payload)
	}
}

#[derive(Debug, Clone)]
pub struct NewAction {
	pub action_type: ActionType,
	pub action_group: Uuid,
	pub payload: Value,
	pub assumptions: Vec<String>,
	pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PayloadUpdate {
	pub action: ProposedAction,
	pub previous: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalRecord {
	pub table: TargetTable,
	pub id: Uuid,
	pub org_id: String,
	pub patient_id: Option<String>,
	pub encounter_id: Option<String>,
	pub run_id: Uuid,
	pub action_id: Uuid,
	pub body: Value,
	pub created_by: String,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
	pub id: Uuid,
	pub org_id: String,
	pub run_id: Uuid,
	pub action_id: Uuid,
	pub actor_id: String,
	pub target_table: TargetTable,
	pub record_id: Uuid,
	pub operation: String,
	pub created_at: OffsetDateTime,
}

/// One clinical row a commit will insert, in write order.
#[derive(Debug, Clone)]
pub struct ClinicalWrite {
	pub action_id: Uuid,
	/// Revision of the action the plan was built from.
	pub revision: i32,
	pub table: TargetTable,
	pub record_id: Uuid,
	pub patient_id: Option<String>,
	pub encounter_id: Option<String>,
	pub body: Value,
}

#[derive(Debug, Clone)]
pub struct CommitPlan {
	pub run_id: Uuid,
	pub org_id: String,
	pub actor_id: String,
	pub action_group: Uuid,
	pub writes: Vec<ClinicalWrite>,
}

#[derive(Debug, Clone)]
pub struct CommitReceipt {
	pub run: Run,
	pub records: Vec<ClinicalRecord>,
	pub audit: Vec<AuditEntry>,
}

#[derive(Debug, Clone)]
pub struct RunDetail {
	pub run: Run,
	pub steps: Vec<Step>,
	pub clarifications: Vec<Clarification>,
	pub actions: Vec<ProposedAction>,
}
impl RunDetail {
	/// The first action group, in staging order, that still has pending members.
	pub fn first_pending_group(&self) -> Option<Uuid> {
		self.actions
			.iter()
			.find(|action| action.status == ActionStatus::Pending)
			.map(|action| action.action_group)
	}

	pub fn group_actions(&self, group: Uuid) -> impl Iterator<Item = &ProposedAction> {
		self.actions.iter().filter(move |action| action.action_group == group)
	}
}
