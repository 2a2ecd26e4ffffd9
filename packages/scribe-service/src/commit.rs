//! Commit engine.
//!
//! A commit is prepared from a snapshot of the run: the first pending group is checked against
//! the safety gate and turned into a plan of clinical writes, each pinned to the action revision
//! it was built from. The store applies the plan as one unit and refuses it if any member changed
//! in between. A storage failure while applying fails the run; nothing of the group is written.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scribe_domain::{
	action::{ActionPayload, ActionStatus, ActionType, TargetTable},
	run::RunStatus,
	safety,
};
use scribe_storage::models::{ClinicalWrite, CommitPlan, ProposedAction, Run, RunDetail};

use crate::{Error, Result, ScribeService, runs};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
	pub org_id: String,
	pub user_id: String,
	pub run_id: Uuid,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
	pub run_id: Uuid,
	pub status: RunStatus,
	pub committed: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub records: Vec<CommittedRecord>,
	pub audit_entries: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedRecord {
	pub table: TargetTable,
	pub record_id: Uuid,
	pub action_id: Uuid,
}

impl ScribeService {
	pub async fn commit_run(&self, req: CommitRequest) -> Result<CommitResponse> {
		if req.user_id.trim().is_empty() {
			return Err(Error::invalid("user_id is required."));
		}

		let detail = self.store.run_detail(&req.org_id, req.run_id).await?;
		let plan = build_plan(&detail, req.user_id.trim())?;
		let action_ids: Vec<Uuid> = plan.writes.iter().map(|write| write.action_id).collect();

		tracing::info!(
			run_id = %req.run_id,
			action_group = %plan.action_group,
			writes = plan.writes.len(),
			"Committing action group."
		);

		match self.store.commit_group(&plan).await {
			Ok(receipt) => {
				self.forget_edits(action_ids);

				tracing::info!(
					run_id = %req.run_id,
					records = receipt.records.len(),
					audit_entries = receipt.audit.len(),
					"Run committed."
				);

				Ok(CommitResponse {
					run_id: receipt.run.id,
					status: receipt.run.status,
					committed: true,
					error_message: None,
					records: receipt
						.records
						.iter()
						.map(|record| CommittedRecord {
							table: record.table,
							record_id: record.id,
							action_id: record.action_id,
						})
						.collect(),
					audit_entries: receipt.audit.len(),
				})
			},
			Err(err @ (scribe_storage::Error::Conflict(_) | scribe_storage::Error::NotFound(_))) =>
				Err(self.conflict_for(&req.org_id, req.run_id, err).await),
			Err(err) => self.fail_commit(&req.org_id, req.run_id, err).await,
		}
	}

	async fn fail_commit(
		&self,
		org_id: &str,
		run_id: Uuid,
		err: scribe_storage::Error,
	) -> Result<CommitResponse> {
		let message = format!("Commit failed: {err}");

		tracing::error!(run_id = %run_id, error = %err, "Commit failed; no clinical rows were written.");

		let run = match self
			.store
			.transition(run_id, &[RunStatus::ReadyToCommit], RunStatus::Failed, Some(&message))
			.await
		{
			Ok(run) => run,
			Err(scribe_storage::Error::Conflict(_)) => self.store.get_run(org_id, run_id).await?,
			Err(other) => return Err(other.into()),
		};

		Ok(CommitResponse {
			run_id: run.id,
			status: run.status,
			committed: false,
			error_message: run.error_message,
			records: Vec::new(),
			audit_entries: 0,
		})
	}
}

/// Checks the commit preconditions against the snapshot and lays out the writes.
fn build_plan(detail: &RunDetail, actor_id: &str) -> Result<CommitPlan> {
	let run = &detail.run;

	if run.status != RunStatus::ReadyToCommit {
		return Err(Error::conflict(
			format!("Run is {}; only ready_to_commit runs can be committed.", run.status),
			run.status,
		));
	}

	let Some(action_group) = detail.first_pending_group() else {
		return Err(Error::conflict("No pending actions to commit.", run.status));
	};
	let mut members: Vec<(&ProposedAction, ActionPayload)> = Vec::new();
	let mut missing = Vec::new();

	for action in detail.group_actions(action_group) {
		if action.status != ActionStatus::Pending {
			continue;
		}

		let (payload, items) = runs::reviewed_payload(action)?;

		missing.extend(
			safety::missing_dispositions(&items, &action.dispositions)
				.into_iter()
				.map(|item| format!("{} ({})", item.key(), action.id)),
		);
		members.push((action, payload));
	}

	if !missing.is_empty() {
		return Err(Error::conflict(
			format!("Safety review incomplete; missing dispositions for: {}.", missing.join(", ")),
			run.status,
		));
	}

	members.sort_by_key(|(action, _)| action.action_type.write_rank());

	let record_ids: Vec<Uuid> = members.iter().map(|_| Uuid::new_v4()).collect();
	let new_encounter = members
		.iter()
		.zip(&record_ids)
		.find(|((action, _), _)| action.action_type == ActionType::EncounterCreation)
		.map(|(_, record_id)| record_id.to_string());
	let writes = members
		.into_iter()
		.zip(record_ids)
		.map(|((action, payload), record_id)| {
			let applied = safety::apply_dispositions(&payload, &action.dispositions);

			ClinicalWrite {
				action_id: action.id,
				revision: action.revision,
				table: action.action_type.target_table(),
				record_id,
				patient_id: run.patient_id.clone(),
				encounter_id: encounter_for(run, action.action_type, record_id, new_encounter.as_deref()),
				body: applied.to_value(),
			}
		})
		.collect();

	Ok(CommitPlan {
		run_id: run.id,
		org_id: run.org_id.clone(),
		actor_id: actor_id.to_string(),
		action_group,
		writes,
	})
}

/// An encounter row is its own encounter. Rows that attach to an encounter use the one created
/// in the same group, else the encounter the run was started for.
fn encounter_for(
	run: &Run,
	action_type: ActionType,
	record_id: Uuid,
	new_encounter: Option<&str>,
) -> Option<String> {
	if action_type == ActionType::EncounterCreation {
		return Some(record_id.to_string());
	}
	if !action_type.attaches_to_encounter() {
		return None;
	}

	new_encounter.map(ToString::to_string).or_else(|| run.encounter_id.clone())
}
