//! In-process [`RunStore`] used by tests and the `memory` storage backend.
//!
//! Multi-row operations are applied to a cloned copy of the state and swapped in only when they
//! succeed, so a failure leaves nothing behind.

use std::{
	future,
	sync::{Mutex, MutexGuard},
};

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use scribe_domain::{
	action::ActionStatus,
	run::{RunStatus, StepKind},
	safety::Disposition,
};

use crate::{
	Error, Result,
	models::{
		AnswerOutcome, AuditEntry, Clarification, ClinicalRecord, CommitPlan, CommitReceipt,
		CreateRunOutcome, NewAction, NewClarification, NewRun, NewStep, PayloadUpdate,
		ProposedAction, Run, RunDetail, Step,
	},
	store::{self, BoxFuture, RUN_NOT_FOUND, RunStore},
};

#[derive(Debug, Clone, Default)]
struct State {
	runs: Vec<Run>,
	steps: Vec<Step>,
	clarifications: Vec<Clarification>,
	actions: Vec<ProposedAction>,
	records: Vec<ClinicalRecord>,
	audit: Vec<AuditEntry>,
}
impl State {
	fn run_index(&self, run_id: Uuid) -> Result<usize> {
		self.runs
			.iter()
			.position(|run| run.id == run_id)
			.ok_or_else(|| Error::NotFound(RUN_NOT_FOUND.to_string()))
	}

	fn org_run(&self, org_id: &str, run_id: Uuid) -> Result<&Run> {
		self.runs
			.iter()
			.find(|run| run.id == run_id && run.org_id == org_id)
			.ok_or_else(|| Error::NotFound(RUN_NOT_FOUND.to_string()))
	}

	fn cas(
		&mut self,
		run_id: Uuid,
		from: &[RunStatus],
		to: RunStatus,
		error_message: Option<&str>,
		now: OffsetDateTime,
	) -> Result<Run> {
		store::check_transition(from, to)?;

		let idx = self.run_index(run_id)?;
		let run = &mut self.runs[idx];

		if !from.contains(&run.status) {
			return Err(store::status_conflict(run, from));
		}

		run.status = to;
		run.updated_at = now;

		if let Some(message) = error_message {
			run.error_message = Some(message.to_string());
		}

		Ok(run.clone())
	}

	fn reviewable_action(&self, org_id: &str, run_id: Uuid, action_id: Uuid) -> Result<usize> {
		let run = self.org_run(org_id, run_id)?;

		if run.status != RunStatus::ReadyToCommit {
			return Err(store::status_conflict(run, &[RunStatus::ReadyToCommit]));
		}

		let idx = self
			.actions
			.iter()
			.position(|action| action.id == action_id && action.run_id == run_id)
			.ok_or_else(|| Error::NotFound("Action not found.".to_string()))?;

		if self.actions[idx].status != ActionStatus::Pending {
			return Err(Error::Conflict(format!(
				"Action is {}; only pending actions can be reviewed.",
				self.actions[idx].status
			)));
		}

		Ok(idx)
	}

	fn push_step(&mut self, run_id: Uuid, step: NewStep, now: OffsetDateTime) -> Step {
		let seq = self.steps.iter().filter(|existing| existing.run_id == run_id).count() as i32 + 1;
		let step = Step {
			id: Uuid::new_v4(),
			run_id,
			seq,
			kind: step.kind,
			tool_name: step.tool_name,
			call_id: step.call_id,
			tool_input: step.tool_input,
			tool_output: step.tool_output,
			text: step.text,
			input_tokens: step.input_tokens,
			output_tokens: step.output_tokens,
			created_at: now,
		};

		self.steps.push(step.clone());

		step
	}
}

#[derive(Debug, Default)]
pub struct MemoryStore {
	state: Mutex<State>,
	write_fault: Mutex<Option<usize>>,
	step_fault: Mutex<Option<StepKind>>,
}
impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Arms a one-shot fault: the next commit fails on its `nth` clinical write (1-based).
	pub fn fail_on_write(&self, nth: usize) {
		*self.write_fault.lock().unwrap_or_else(|err| err.into_inner()) = Some(nth);
	}

	pub fn clear_write_fault(&self) {
		*self.write_fault.lock().unwrap_or_else(|err| err.into_inner()) = None;
	}

	/// Arms a one-shot fault: the next append of a step of this kind fails.
	pub fn fail_on_step(&self, kind: StepKind) {
		*self.step_fault.lock().unwrap_or_else(|err| err.into_inner()) = Some(kind);
	}

	/// Number of clinical rows across every target table.
	pub fn clinical_row_count(&self) -> usize {
		self.lock().records.len()
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(|err| err.into_inner())
	}

	fn take_write_fault(&self) -> Option<usize> {
		self.write_fault.lock().unwrap_or_else(|err| err.into_inner()).take()
	}

	fn create_run_now(&self, new: NewRun) -> Result<CreateRunOutcome> {
		let mut state = self.lock();

		if let Some(key) = new.idempotency_key.as_deref()
			&& let Some(existing) = state.runs.iter().find(|run| {
				run.org_id == new.org_id
					&& run.idempotency_key.as_deref() == Some(key)
					&& run.status != RunStatus::Failed
			}) {
			return Ok(CreateRunOutcome { run: existing.clone(), created: false });
		}

		let now = OffsetDateTime::now_utc();
		let run = Run {
			id: Uuid::new_v4(),
			org_id: new.org_id,
			user_id: new.user_id,
			patient_id: new.patient_id,
			encounter_id: new.encounter_id,
			idempotency_key: new.idempotency_key,
			input_fingerprint: new.input_fingerprint,
			input_text: new.input_text,
			intent_type: new.intent_type,
			status: RunStatus::Pending,
			error_message: None,
			summary: None,
			rejection_reason: None,
			input_tokens: 0,
			output_tokens: 0,
			created_at: now,
			updated_at: now,
		};

		state.runs.push(run.clone());

		Ok(CreateRunOutcome { run, created: true })
	}

	fn run_detail_now(&self, org_id: &str, run_id: Uuid) -> Result<RunDetail> {
		let state = self.lock();
		let run = state.org_run(org_id, run_id)?.clone();

		Ok(RunDetail {
			run,
			steps: state.steps.iter().filter(|step| step.run_id == run_id).cloned().collect(),
			clarifications: state
				.clarifications
				.iter()
				.filter(|clarification| clarification.run_id == run_id)
				.cloned()
				.collect(),
			actions: state.actions.iter().filter(|action| action.run_id == run_id).cloned().collect(),
		})
	}

	fn append_step_now(&self, run_id: Uuid, step: NewStep) -> Result<Step> {
		{
			let mut fault = self.step_fault.lock().unwrap_or_else(|err| err.into_inner());

			if *fault == Some(step.kind) {
				*fault = None;

				return Err(Error::Injected(format!("append of a {} step failed", step.kind)));
			}
		}

		let mut state = self.lock();
		let idx = state.run_index(run_id)?;

		if state.runs[idx].status != RunStatus::Running {
			return Err(store::status_conflict(&state.runs[idx], &[RunStatus::Running]));
		}

		let now = OffsetDateTime::now_utc();
		let run = &mut state.runs[idx];

		run.input_tokens += step.input_tokens;
		run.output_tokens += step.output_tokens;
		run.updated_at = now;

		Ok(state.push_step(run_id, step, now))
	}

	fn suspend_now(&self, run_id: Uuid, questions: Vec<NewClarification>) -> Result<Vec<Clarification>> {
		store::validate_questions(&questions)?;

		let mut state = self.lock();
		let now = OffsetDateTime::now_utc();

		state.cas(run_id, &[RunStatus::Running], RunStatus::NeedsClarification, None, now)?;

		let offset = state.clarifications.iter().filter(|c| c.run_id == run_id).count() as i32;
		let created: Vec<Clarification> = questions
			.into_iter()
			.enumerate()
			.map(|(idx, question)| Clarification {
				id: Uuid::new_v4(),
				run_id,
				seq: offset + idx as i32 + 1,
				question: question.question,
				options: question.options,
				answer: None,
				created_at: now,
				answered_at: None,
			})
			.collect();

		state.clarifications.extend(created.iter().cloned());

		Ok(created)
	}

	fn answer_now(&self, org_id: &str, clarification_id: Uuid, answer: &str) -> Result<AnswerOutcome> {
		let mut state = self.lock();
		let not_found = || Error::NotFound("Clarification not found.".to_string());
		let idx = state
			.clarifications
			.iter()
			.position(|clarification| clarification.id == clarification_id)
			.ok_or_else(not_found)?;
		let run_id = state.clarifications[idx].run_id;
		let run = state.org_run(org_id, run_id).map_err(|_| not_found())?;

		if run.status != RunStatus::NeedsClarification {
			return Err(store::status_conflict(run, &[RunStatus::NeedsClarification]));
		}

		let now = OffsetDateTime::now_utc();

		let existing = state.clarifications[idx].answer.clone();

		match existing.as_deref() {
			Some(existing) if existing == answer => {},
			Some(_) => return Err(Error::Conflict("Clarification was already answered.".to_string())),
			None => {
				let clarification = &mut state.clarifications[idx];

				clarification.answer = Some(answer.to_string());
				clarification.answered_at = Some(now);
			},
		}

		let remaining: Vec<Clarification> = state
			.clarifications
			.iter()
			.filter(|clarification| clarification.run_id == run_id && clarification.answer.is_none())
			.cloned()
			.collect();
		let resumed = remaining.is_empty();
		let run = if resumed {
			state.cas(run_id, &[RunStatus::NeedsClarification], RunStatus::Running, None, now)?
		} else {
			state.org_run(org_id, run_id)?.clone()
		};

		Ok(AnswerOutcome { run, clarification: state.clarifications[idx].clone(), remaining, resumed })
	}

	fn stage_now(&self, run_id: Uuid, summary: &str, actions: Vec<NewAction>) -> Result<Vec<ProposedAction>> {
		let mut state = self.lock();
		let now = OffsetDateTime::now_utc();

		state.cas(run_id, &[RunStatus::Running], RunStatus::ReadyToCommit, None, now)?;

		let idx = state.run_index(run_id)?;

		state.runs[idx].summary = Some(summary.to_string());

		let staged: Vec<ProposedAction> = actions
			.into_iter()
			.enumerate()
			.map(|(idx, action)| ProposedAction {
				id: Uuid::new_v4(),
				run_id,
				seq: idx as i32 + 1,
				action_type: action.action_type,
				action_group: action.action_group,
				payload: action.payload,
				provider_modified_payload: None,
				status: ActionStatus::Pending,
				assumptions: action.assumptions,
				confidence_score: action.confidence_score,
				dispositions: Vec::new(),
				revision: 0,
				created_at: now,
				updated_at: now,
			})
			.collect();

		state.actions.extend(staged.iter().cloned());

		Ok(staged)
	}

	fn update_payload_now(
		&self,
		org_id: &str,
		run_id: Uuid,
		action_id: Uuid,
		payload: Option<Value>,
	) -> Result<PayloadUpdate> {
		let mut state = self.lock();
		let idx = state.reviewable_action(org_id, run_id, action_id)?;
		let action = &mut state.actions[idx];
		let previous = std::mem::replace(&mut action.provider_modified_payload, payload);

		action.revision += 1;
		action.updated_at = OffsetDateTime::now_utc();

		Ok(PayloadUpdate { action: action.clone(), previous })
	}

	fn record_dispositions_now(
		&self,
		org_id: &str,
		run_id: Uuid,
		action_id: Uuid,
		dispositions: Vec<Disposition>,
	) -> Result<ProposedAction> {
		let mut state = self.lock();
		let idx = state.reviewable_action(org_id, run_id, action_id)?;
		let action = &mut state.actions[idx];

		action.dispositions = store::merge_dispositions(&action.dispositions, dispositions);
		action.revision += 1;
		action.updated_at = OffsetDateTime::now_utc();

		Ok(action.clone())
	}

	fn commit_now(&self, plan: &CommitPlan) -> Result<CommitReceipt> {
		let fault = self.take_write_fault();
		let mut state = self.lock();

		state.org_run(&plan.org_id, plan.run_id)?;

		let mut working = state.clone();
		let now = OffsetDateTime::now_utc();

		working.cas(plan.run_id, &[RunStatus::ReadyToCommit], RunStatus::Committing, None, now)?;

		for write in &plan.writes {
			let action = working
				.actions
				.iter_mut()
				.find(|action| action.id == write.action_id && action.run_id == plan.run_id)
				.ok_or_else(|| Error::NotFound("Action not found.".to_string()))?;

			if action.status != ActionStatus::Pending
				|| action.revision != write.revision
				|| action.action_group != plan.action_group
			{
				return Err(Error::Conflict("Action changed while the commit was prepared.".to_string()));
			}

			action.status = ActionStatus::Committed;
			action.updated_at = now;
		}

		if working
			.actions
			.iter()
			.any(|a| a.action_group == plan.action_group && a.status == ActionStatus::Pending)
		{
			return Err(Error::Conflict("Commit plan does not cover the whole group.".to_string()));
		}

		let mut records = Vec::with_capacity(plan.writes.len());
		let mut audit = Vec::with_capacity(plan.writes.len());

		for (idx, write) in plan.writes.iter().enumerate() {
			if fault == Some(idx + 1) {
				return Err(Error::Injected(format!("write {} to {} failed", idx + 1, write.table)));
			}

			records.push(ClinicalRecord {
				table: write.table,
				id: write.record_id,
				org_id: plan.org_id.clone(),
				patient_id: write.patient_id.clone(),
				encounter_id: write.encounter_id.clone(),
				run_id: plan.run_id,
				action_id: write.action_id,
				body: write.body.clone(),
				created_by: plan.actor_id.clone(),
				created_at: now,
			});
			audit.push(AuditEntry {
				id: Uuid::new_v4(),
				org_id: plan.org_id.clone(),
				run_id: plan.run_id,
				action_id: write.action_id,
				actor_id: plan.actor_id.clone(),
				target_table: write.table,
				record_id: write.record_id,
				operation: "insert".to_string(),
				created_at: now,
			});
		}

		working.records.extend(records.iter().cloned());
		working.audit.extend(audit.iter().cloned());

		let run = working.cas(plan.run_id, &[RunStatus::Committing], RunStatus::Committed, None, now)?;

		*state = working;

		Ok(CommitReceipt { run, records, audit })
	}

	fn reject_now(&self, org_id: &str, run_id: Uuid, reason: Option<&str>) -> Result<Run> {
		let mut state = self.lock();

		state.org_run(org_id, run_id)?;

		let now = OffsetDateTime::now_utc();
		let mut run = state.cas(
			run_id,
			&[RunStatus::ReadyToCommit, RunStatus::NeedsClarification],
			RunStatus::Rejected,
			None,
			now,
		)?;
		let idx = state.run_index(run_id)?;

		state.runs[idx].rejection_reason = reason.map(ToString::to_string);
		run.rejection_reason = reason.map(ToString::to_string);

		for action in state.actions.iter_mut().filter(|action| action.run_id == run_id) {
			if action.status == ActionStatus::Pending {
				action.status = ActionStatus::Rejected;
				action.updated_at = now;
			}
		}

		let mut step = NewStep::new(StepKind::Rejection);

		step.text = reason.map(ToString::to_string);
		state.push_step(run_id, step, now);

		Ok(run)
	}
}

impl RunStore for MemoryStore {
	fn create_run<'a>(&'a self, run: NewRun) -> BoxFuture<'a, Result<CreateRunOutcome>> {
		Box::pin(future::ready(self.create_run_now(run)))
	}

	fn get_run<'a>(&'a self, org_id: &'a str, run_id: Uuid) -> BoxFuture<'a, Result<Run>> {
		Box::pin(future::ready(self.lock().org_run(org_id, run_id).cloned()))
	}

	fn run_detail<'a>(&'a self, org_id: &'a str, run_id: Uuid) -> BoxFuture<'a, Result<RunDetail>> {
		Box::pin(future::ready(self.run_detail_now(org_id, run_id)))
	}

	fn get_clarification<'a>(
		&'a self,
		org_id: &'a str,
		clarification_id: Uuid,
	) -> BoxFuture<'a, Result<Clarification>> {
		let state = self.lock();
		let result = state
			.clarifications
			.iter()
			.find(|clarification| {
				clarification.id == clarification_id
					&& state.org_run(org_id, clarification.run_id).is_ok()
			})
			.cloned()
			.ok_or_else(|| Error::NotFound("Clarification not found.".to_string()));

		Box::pin(future::ready(result))
	}

	fn transition<'a>(
		&'a self,
		run_id: Uuid,
		from: &'a [RunStatus],
		to: RunStatus,
		error_message: Option<&'a str>,
	) -> BoxFuture<'a, Result<Run>> {
		let result = self.lock().cas(run_id, from, to, error_message, OffsetDateTime::now_utc());

		Box::pin(future::ready(result))
	}

	fn append_step<'a>(&'a self, run_id: Uuid, step: NewStep) -> BoxFuture<'a, Result<Step>> {
		Box::pin(future::ready(self.append_step_now(run_id, step)))
	}

	fn suspend_for_clarification<'a>(
		&'a self,
		run_id: Uuid,
		questions: Vec<NewClarification>,
	) -> BoxFuture<'a, Result<Vec<Clarification>>> {
		Box::pin(future::ready(self.suspend_now(run_id, questions)))
	}

	fn answer_clarification<'a>(
		&'a self,
		org_id: &'a str,
		clarification_id: Uuid,
		answer: &'a str,
	) -> BoxFuture<'a, Result<AnswerOutcome>> {
		Box::pin(future::ready(self.answer_now(org_id, clarification_id, answer)))
	}

	fn stage_actions<'a>(
		&'a self,
		run_id: Uuid,
		summary: &'a str,
		actions: Vec<NewAction>,
	) -> BoxFuture<'a, Result<Vec<ProposedAction>>> {
		Box::pin(future::ready(self.stage_now(run_id, summary, actions)))
	}

	fn update_action_payload<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		action_id: Uuid,
		payload: Option<Value>,
	) -> BoxFuture<'a, Result<PayloadUpdate>> {
		Box::pin(future::ready(self.update_payload_now(org_id, run_id, action_id, payload)))
	}

	fn record_dispositions<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		action_id: Uuid,
		dispositions: Vec<Disposition>,
	) -> BoxFuture<'a, Result<ProposedAction>> {
		Box::pin(future::ready(self.record_dispositions_now(org_id, run_id, action_id, dispositions)))
	}

	fn commit_group<'a>(&'a self, plan: &'a CommitPlan) -> BoxFuture<'a, Result<CommitReceipt>> {
		Box::pin(future::ready(self.commit_now(plan)))
	}

	fn reject_run<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		reason: Option<&'a str>,
	) -> BoxFuture<'a, Result<Run>> {
		Box::pin(future::ready(self.reject_now(org_id, run_id, reason)))
	}

	fn audit_entries<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
	) -> BoxFuture<'a, Result<Vec<AuditEntry>>> {
		let state = self.lock();
		let result: Result<Vec<AuditEntry>> = state.org_run(org_id, run_id).map(|_| {
			state.audit.iter().filter(|entry| entry.run_id == run_id).cloned().collect()
		});

		Box::pin(future::ready(result))
	}

	fn patient_records<'a>(
		&'a self,
		org_id: &'a str,
		patient_id: &'a str,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<ClinicalRecord>>> {
		let records: Vec<ClinicalRecord> = self
			.lock()
			.records
			.iter()
			.rev()
			.filter(|record| {
				record.org_id == org_id && record.patient_id.as_deref() == Some(patient_id)
			})
			.take(limit)
			.cloned()
			.collect();

		Box::pin(future::ready(Ok(records)))
	}
}
