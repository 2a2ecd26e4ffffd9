use scribe_service::{CommitRequest, Error, PatchActionRequest, RejectRequest, RespondRequest};

use super::{call, harness, staged_three, submit};

const OTHER_ORG: &str = "org-b";

#[tokio::test]
async fn other_organizations_see_nothing() {
	let harness = harness(Vec::new());
	let staged = staged_three(&harness).await;
	let action_id = staged.proposed_actions.as_ref().expect("Actions should be staged.")[0].action_id;

	assert!(matches!(
		harness.service.get_run(OTHER_ORG, staged.run_id).await,
		Err(Error::NotFound { .. })
	));
	assert!(matches!(
		harness.service.audit_trail(OTHER_ORG, staged.run_id).await,
		Err(Error::NotFound { .. })
	));
	assert!(matches!(
		harness
			.service
			.commit_run(CommitRequest {
				org_id: OTHER_ORG.to_string(),
				user_id: "intruder".to_string(),
				run_id: staged.run_id,
			})
			.await,
		Err(Error::NotFound { .. })
	));
	assert!(matches!(
		harness
			.service
			.patch_action(PatchActionRequest {
				org_id: OTHER_ORG.to_string(),
				run_id: staged.run_id,
				action_id,
				provider_modified_payload: None,
			})
			.await,
		Err(Error::NotFound { .. })
	));
	assert!(matches!(
		harness
			.service
			.reject_run(RejectRequest {
				org_id: OTHER_ORG.to_string(),
				run_id: staged.run_id,
				reason: None,
			})
			.await,
		Err(Error::NotFound { .. })
	));
	assert_eq!(harness.store.clinical_row_count(), 0);
}

#[tokio::test]
async fn clarifications_are_scoped_to_their_organization() {
	let harness = harness(vec![call(
		"ask_clarification",
		serde_json::json!({ "questions": [{ "question": "Which day?" }] }),
	)]);
	let suspended = submit(&harness, "Schedule a follow-up for P1").await;
	let question = suspended.clarifications.expect("Open questions should be listed.")[0].clarification_id;
	let err = harness
		.service
		.respond_clarification(RespondRequest {
			org_id: OTHER_ORG.to_string(),
			clarification_id: question,
			answer: "Monday".to_string(),
		})
		.await
		.expect_err("Another organization cannot answer.");

	assert!(matches!(err, Error::NotFound { .. }));
}
