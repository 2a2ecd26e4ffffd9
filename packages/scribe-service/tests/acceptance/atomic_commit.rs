use scribe_domain::{action::ActionStatus, run::RunStatus};
use scribe_service::CommitRequest;

use super::{CLINICIAN, ORG, harness, staged_three};

fn commit(run_id: uuid::Uuid) -> CommitRequest {
	CommitRequest { org_id: ORG.to_string(), user_id: CLINICIAN.to_string(), run_id }
}

#[tokio::test]
async fn failed_write_discards_the_whole_group() {
	let harness = harness(Vec::new());
	let staged = staged_three(&harness).await;

	assert_eq!(staged.status, RunStatus::ReadyToCommit);
	assert_eq!(staged.proposed_actions.as_ref().map(Vec::len), Some(3));

	harness.store.fail_on_write(2);

	let result = harness.service.commit_run(commit(staged.run_id)).await.expect("commit_run failed.");

	assert!(!result.committed);
	assert_eq!(result.status, RunStatus::Failed);
	assert!(result.error_message.unwrap_or_default().contains("Commit failed"));
	assert!(result.records.is_empty());
	assert_eq!(harness.store.clinical_row_count(), 0);

	let audit = harness.service.audit_trail(ORG, staged.run_id).await.expect("audit_trail failed.");

	assert!(audit.is_empty());

	let detail = harness.service.get_run(ORG, staged.run_id).await.expect("get_run failed.");

	assert_eq!(detail.run.status, RunStatus::Failed);
	assert!(detail.actions.iter().all(|action| action.status == ActionStatus::Pending));

	let err = harness
		.service
		.commit_run(commit(staged.run_id))
		.await
		.expect_err("A failed run cannot be committed.");

	assert!(super::is_conflict(&err, RunStatus::Failed));
}

#[tokio::test]
async fn successful_commit_writes_every_member_with_audit() {
	let harness = harness(Vec::new());
	let staged = staged_three(&harness).await;
	let result = harness.service.commit_run(commit(staged.run_id)).await.expect("commit_run failed.");

	assert!(result.committed);
	assert_eq!(result.status, RunStatus::Committed);
	assert_eq!(result.records.len(), 3);
	assert_eq!(result.audit_entries, 3);
	assert_eq!(harness.store.clinical_row_count(), 3);

	let audit = harness.service.audit_trail(ORG, staged.run_id).await.expect("audit_trail failed.");

	assert_eq!(audit.len(), 3);
	assert!(audit.iter().all(|entry| entry.actor_id == CLINICIAN && entry.operation == "insert"));

	let detail = harness.service.get_run(ORG, staged.run_id).await.expect("get_run failed.");

	assert!(detail.actions.iter().all(|action| action.status == ActionStatus::Committed));

	let err = harness
		.service
		.commit_run(commit(staged.run_id))
		.await
		.expect_err("A committed run cannot be committed again.");

	assert!(super::is_conflict(&err, RunStatus::Committed));
	assert_eq!(harness.store.clinical_row_count(), 3);
}

#[tokio::test]
async fn empty_submission_has_nothing_to_commit() {
	let harness = harness(vec![super::submit_results("Nothing to change.")]);
	let staged = super::submit(&harness, "Check whether P1 needs anything today").await;

	assert_eq!(staged.status, RunStatus::ReadyToCommit);
	assert_eq!(staged.proposed_actions.as_ref().map(Vec::len), Some(0));

	let err = harness
		.service
		.commit_run(commit(staged.run_id))
		.await
		.expect_err("An empty run has no pending actions.");

	assert!(super::is_conflict(&err, RunStatus::ReadyToCommit));
}
