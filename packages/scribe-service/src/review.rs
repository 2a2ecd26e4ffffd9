//! Reviewer edits on staged actions: payload overrides, their undo, and safety dispositions.
//!
//! All of them require the run to be `ready_to_commit` and the action to still be pending. Each
//! change bumps the action's revision so a commit prepared against an older view is refused.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use scribe_domain::{
	action::ActionPayload,
	run::RunStatus,
	safety::Disposition,
};
use scribe_storage::models::ProposedAction;

use crate::{ActionView, EditHistory, Error, Result, ScribeService, runs};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchActionRequest {
	pub org_id: String,
	pub run_id: Uuid,
	pub action_id: Uuid,
	/// `None` clears the override so the model's payload applies again.
	pub provider_modified_payload: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UndoRequest {
	pub org_id: String,
	pub run_id: Uuid,
	pub action_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispositionsRequest {
	pub org_id: String,
	pub run_id: Uuid,
	pub action_id: Uuid,
	pub dispositions: Vec<Disposition>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEditResponse {
	pub success: bool,
	pub action: ActionView,
	/// Edits that can still be undone for this action.
	pub undo_depth: usize,
}

impl ScribeService {
	pub async fn patch_action(&self, req: PatchActionRequest) -> Result<ActionEditResponse> {
		let action = self.reviewable_action(&req.org_id, req.run_id, req.action_id).await?;

		if let Some(payload) = req.provider_modified_payload.as_ref() {
			ActionPayload::from_value(action.action_type, payload)?;
		}

		let update = match self
			.store
			.update_action_payload(&req.org_id, req.run_id, req.action_id, req.provider_modified_payload)
			.await
		{
			Ok(update) => update,
			Err(err) => return Err(self.conflict_for(&req.org_id, req.run_id, err).await),
		};
		let undo_depth = {
			let mut edits = self.edits();
			let history = edits.entry(req.action_id).or_insert_with(|| self.new_history());

			history.push(update.previous);

			history.len()
		};

		tracing::info!(
			run_id = %req.run_id,
			action_id = %req.action_id,
			revision = update.action.revision,
			"Action payload edited."
		);

		Ok(ActionEditResponse { success: true, action: runs::action_view(&update.action), undo_depth })
	}

	/// Restores the override that was in place before the latest edit.
	pub async fn undo_action_edit(&self, req: UndoRequest) -> Result<ActionEditResponse> {
		self.reviewable_action(&req.org_id, req.run_id, req.action_id).await?;

		let previous = self.edits().get_mut(&req.action_id).and_then(EditHistory::pop);
		let Some(previous) = previous else {
			return Err(Error::conflict("No edits to undo.", RunStatus::ReadyToCommit));
		};
		let result = self
			.store
			.update_action_payload(&req.org_id, req.run_id, req.action_id, previous.clone())
			.await;
		let update = match result {
			Ok(update) => update,
			Err(err) => {
				// Put the entry back so a retried undo sees the same history.
				self.edits().entry(req.action_id).or_insert_with(|| self.new_history()).push(previous);

				return Err(self.conflict_for(&req.org_id, req.run_id, err).await);
			},
		};
		let undo_depth = self.edits().get(&req.action_id).map(EditHistory::len).unwrap_or(0);

		tracing::info!(
			run_id = %req.run_id,
			action_id = %req.action_id,
			undo_depth,
			"Action edit undone."
		);

		Ok(ActionEditResponse { success: true, action: runs::action_view(&update.action), undo_depth })
	}

	pub async fn record_dispositions(&self, req: DispositionsRequest) -> Result<ActionEditResponse> {
		if req.dispositions.is_empty() {
			return Err(Error::invalid("dispositions must be non-empty."));
		}

		let action = self.reviewable_action(&req.org_id, req.run_id, req.action_id).await?;
		let (_, items) = runs::reviewed_payload(&action)?;
		let gated: Vec<String> = items.iter().map(|item| item.key()).collect();
		let mut dispositions = Vec::with_capacity(req.dispositions.len());

		for disposition in req.dispositions {
			let key = disposition.validate()?.key();

			if !gated.contains(&key) {
				return Err(Error::invalid(format!("{key} is not a gated item of this action.")));
			}

			dispositions.push(Disposition { item: key, ..disposition });
		}

		let action = match self
			.store
			.record_dispositions(&req.org_id, req.run_id, req.action_id, dispositions)
			.await
		{
			Ok(action) => action,
			Err(err) => return Err(self.conflict_for(&req.org_id, req.run_id, err).await),
		};
		let view = runs::action_view(&action);

		tracing::info!(
			run_id = %req.run_id,
			action_id = %req.action_id,
			missing = view.missing_dispositions.len(),
			"Dispositions recorded."
		);

		let undo_depth = self.edits().get(&req.action_id).map(EditHistory::len).unwrap_or(0);

		Ok(ActionEditResponse { success: true, action: view, undo_depth })
	}

	/// Loads an action for review. Reviews are only open while the run waits on them.
	async fn reviewable_action(
		&self,
		org_id: &str,
		run_id: Uuid,
		action_id: Uuid,
	) -> Result<ProposedAction> {
		let detail = self.store.run_detail(org_id, run_id).await?;

		if detail.run.status != RunStatus::ReadyToCommit {
			return Err(Error::conflict(
				format!("Run is {}; actions can only be reviewed while ready_to_commit.", detail.run.status),
				detail.run.status,
			));
		}

		detail
			.actions
			.into_iter()
			.find(|action| action.id == action_id)
			.ok_or_else(|| Error::NotFound { message: "Action not found.".to_string() })
	}

	fn new_history(&self) -> EditHistory {
		EditHistory::new(self.cfg.agent.undo_depth as usize)
	}
}
