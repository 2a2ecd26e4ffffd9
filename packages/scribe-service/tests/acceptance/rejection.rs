use scribe_domain::{
	action::ActionStatus,
	run::{RunStatus, StepKind},
};
use scribe_service::{CommitRequest, RejectRequest};

use super::{CLINICIAN, ORG, call, harness, staged_three, submit};

fn reject(run_id: uuid::Uuid, reason: Option<&str>) -> RejectRequest {
	RejectRequest { org_id: ORG.to_string(), run_id, reason: reason.map(ToString::to_string) }
}

#[tokio::test]
async fn rejection_writes_nothing_clinical() {
	let harness = harness(Vec::new());
	let staged = staged_three(&harness).await;
	let rejected = harness
		.service
		.reject_run(reject(staged.run_id, Some("  Wrong patient.  ")))
		.await
		.expect("reject_run failed.");

	assert_eq!(rejected.status, RunStatus::Rejected);
	assert_eq!(rejected.rejected_actions, 3);
	assert_eq!(rejected.reason.as_deref(), Some("Wrong patient."));
	assert_eq!(harness.store.clinical_row_count(), 0);
	assert!(
		harness.service.audit_trail(ORG, staged.run_id).await.expect("audit_trail failed.").is_empty()
	);

	let detail = harness.service.get_run(ORG, staged.run_id).await.expect("get_run failed.");

	assert!(detail.actions.iter().all(|action| action.status == ActionStatus::Rejected));
	assert_eq!(detail.steps.last().map(|step| step.kind), Some(StepKind::Rejection));
	assert_eq!(detail.run.rejection_reason.as_deref(), Some("Wrong patient."));

	let err = harness
		.service
		.commit_run(CommitRequest {
			org_id: ORG.to_string(),
			user_id: CLINICIAN.to_string(),
			run_id: staged.run_id,
		})
		.await
		.expect_err("A rejected run cannot be committed.");

	assert!(super::is_conflict(&err, RunStatus::Rejected));
}

#[tokio::test]
async fn a_run_waiting_on_questions_can_be_rejected() {
	let harness = harness(vec![call(
		"ask_clarification",
		serde_json::json!({ "questions": [{ "question": "Which medication?" }] }),
	)]);
	let suspended = submit(&harness, "Adjust the medication for P1").await;

	assert_eq!(suspended.status, RunStatus::NeedsClarification);

	let rejected =
		harness.service.reject_run(reject(suspended.run_id, None)).await.expect("reject_run failed.");

	assert_eq!(rejected.status, RunStatus::Rejected);
	assert_eq!(rejected.rejected_actions, 0);
	assert_eq!(rejected.reason, None);
}

#[tokio::test]
async fn terminal_runs_cannot_be_rejected() {
	let harness = harness(Vec::new());
	let staged = staged_three(&harness).await;

	harness
		.service
		.commit_run(CommitRequest {
			org_id: ORG.to_string(),
			user_id: CLINICIAN.to_string(),
			run_id: staged.run_id,
		})
		.await
		.expect("commit_run failed.");

	let err = harness
		.service
		.reject_run(reject(staged.run_id, Some("Too late.")))
		.await
		.expect_err("A committed run cannot be rejected.");

	assert!(super::is_conflict(&err, RunStatus::Committed));
	assert_eq!(harness.store.clinical_row_count(), 3);
}
