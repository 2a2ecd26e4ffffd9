//! Record-store seam for the run ledger and the clinical tables.
//!
//! Every method is one atomic unit: it either applies fully or leaves the store unchanged. Status
//! changes are compare-and-swap over an explicit set of source statuses, which is how concurrent
//! callers are kept from driving the same run twice.

use std::{future::Future, pin::Pin};

use serde_json::Value;
use uuid::Uuid;

use scribe_domain::{run::RunStatus, safety::Disposition};

use crate::{
	Error, Result,
	models::{
		AnswerOutcome, AuditEntry, Clarification, ClinicalRecord, CommitPlan, CommitReceipt,
		CreateRunOutcome, NewAction, NewClarification, NewRun, NewStep, PayloadUpdate,
		ProposedAction, Run, RunDetail, Step,
	},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const RUN_NOT_FOUND: &str = "Run not found.";

pub trait RunStore
where
	Self: Send + Sync,
{
	/// Inserts a run, or returns the live run already holding the same `(org_id,
	/// idempotency_key)`.
	fn create_run<'a>(&'a self, run: NewRun) -> BoxFuture<'a, Result<CreateRunOutcome>>;

	/// Runs of other organizations are reported as not found.
	fn get_run<'a>(&'a self, org_id: &'a str, run_id: Uuid) -> BoxFuture<'a, Result<Run>>;

	fn run_detail<'a>(&'a self, org_id: &'a str, run_id: Uuid) -> BoxFuture<'a, Result<RunDetail>>;

	fn transition<'a>(
		&'a self,
		run_id: Uuid,
		from: &'a [RunStatus],
		to: RunStatus,
		error_message: Option<&'a str>,
	) -> BoxFuture<'a, Result<Run>>;

	/// Appends a step to a running run and adds its token counts to the run.
	fn append_step<'a>(&'a self, run_id: Uuid, step: NewStep) -> BoxFuture<'a, Result<Step>>;

	/// Moves `running -> needs_clarification` and persists the questions with it.
	fn suspend_for_clarification<'a>(
		&'a self,
		run_id: Uuid,
		questions: Vec<NewClarification>,
	) -> BoxFuture<'a, Result<Vec<Clarification>>>;

	/// Clarifications of runs in other organizations are reported as not found.
	fn get_clarification<'a>(
		&'a self,
		org_id: &'a str,
		clarification_id: Uuid,
	) -> BoxFuture<'a, Result<Clarification>>;

	/// Records one answer. When no question is left open the run moves back to `running` in the
	/// same unit and the outcome reports `resumed`.
	fn answer_clarification<'a>(
		&'a self,
		org_id: &'a str,
		clarification_id: Uuid,
		answer: &'a str,
	) -> BoxFuture<'a, Result<AnswerOutcome>>;

	/// Moves `running -> ready_to_commit` and persists the proposed actions with it.
	fn stage_actions<'a>(
		&'a self,
		run_id: Uuid,
		summary: &'a str,
		actions: Vec<NewAction>,
	) -> BoxFuture<'a, Result<Vec<ProposedAction>>>;

	fn update_action_payload<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		action_id: Uuid,
		payload: Option<Value>,
	) -> BoxFuture<'a, Result<PayloadUpdate>>;

	/// Merges dispositions into the action, replacing earlier ones for the same item.
	fn record_dispositions<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		action_id: Uuid,
		dispositions: Vec<Disposition>,
	) -> BoxFuture<'a, Result<ProposedAction>>;

	/// Applies a commit plan: `ready_to_commit -> committing`, every clinical write with its audit
	/// entry, every group member marked committed, then `committing -> committed`. Any failure
	/// discards all of it. A plan built from a stale revision is a conflict.
	fn commit_group<'a>(&'a self, plan: &'a CommitPlan) -> BoxFuture<'a, Result<CommitReceipt>>;

	/// Moves the run to `rejected`, marks its pending actions rejected, and records a rejection
	/// step. Clinical tables and the audit trail are not touched.
	fn reject_run<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		reason: Option<&'a str>,
	) -> BoxFuture<'a, Result<Run>>;

	fn audit_entries<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
	) -> BoxFuture<'a, Result<Vec<AuditEntry>>>;

	/// Committed clinical rows for a patient, newest first.
	fn patient_records<'a>(
		&'a self,
		org_id: &'a str,
		patient_id: &'a str,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<ClinicalRecord>>>;
}

pub(crate) fn check_transition(from: &[RunStatus], to: RunStatus) -> Result<()> {
	if from.is_empty() {
		return Err(Error::InvalidArgument("Transition needs at least one source status.".to_string()));
	}

	if let Some(bad) = from.iter().find(|status| !status.can_transition_to(to)) {
		return Err(Error::InvalidArgument(format!("Transition {bad} -> {to} is not allowed.")));
	}

	Ok(())
}

pub(crate) fn status_conflict(run: &Run, expected: &[RunStatus]) -> Error {
	let expected = expected.iter().map(|status| status.as_str()).collect::<Vec<_>>().join(" or ");

	Error::Conflict(format!("Run is {}; expected {expected}.", run.status))
}

pub(crate) fn validate_questions(questions: &[NewClarification]) -> Result<()> {
	if questions.is_empty() {
		return Err(Error::InvalidArgument("At least one clarification is required.".to_string()));
	}
	if questions.iter().any(|q| q.question.trim().is_empty()) {
		return Err(Error::InvalidArgument("Clarification questions must be non-empty.".to_string()));
	}

	Ok(())
}

/// Replaces dispositions for the same item and keeps the rest in order.
pub(crate) fn merge_dispositions(existing: &[Disposition], incoming: Vec<Disposition>) -> Vec<Disposition> {
	let mut merged: Vec<Disposition> = existing
		.iter()
		.filter(|old| !incoming.iter().any(|new| new.item == old.item))
		.cloned()
		.collect();

	merged.extend(incoming);

	merged
}
