use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scribe_domain::{action::ActionStatus, run::RunStatus};

use crate::{Error, Result, ScribeService};

const MAX_REASON_CHARS: usize = 2_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RejectRequest {
	pub org_id: String,
	pub run_id: Uuid,
	pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectResponse {
	pub run_id: Uuid,
	pub status: RunStatus,
	pub rejected_actions: usize,
	pub reason: Option<String>,
}

impl ScribeService {
	/// Discards a run waiting on a human. Staged actions are marked rejected; clinical tables
	/// and the audit trail are left as they were.
	pub async fn reject_run(&self, req: RejectRequest) -> Result<RejectResponse> {
		let reason = req.reason.as_deref().map(str::trim).filter(|reason| !reason.is_empty());

		if reason.map(|reason| reason.chars().count() > MAX_REASON_CHARS).unwrap_or(false) {
			return Err(Error::invalid(format!("reason must be at most {MAX_REASON_CHARS} characters.")));
		}

		let run = match self.store.reject_run(&req.org_id, req.run_id, reason).await {
			Ok(run) => run,
			Err(err) => return Err(self.conflict_for(&req.org_id, req.run_id, err).await),
		};
		let detail = self.store.run_detail(&req.org_id, run.id).await?;
		let rejected: Vec<Uuid> = detail
			.actions
			.iter()
			.filter(|action| action.status == ActionStatus::Rejected)
			.map(|action| action.id)
			.collect();
		let rejected_actions = rejected.len();

		self.forget_edits(rejected);

		tracing::info!(run_id = %run.id, rejected_actions, "Run rejected.");

		Ok(RejectResponse {
			run_id: run.id,
			status: run.status,
			rejected_actions,
			reason: run.rejection_reason,
		})
	}
}
