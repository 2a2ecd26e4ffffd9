use scribe_domain::run::RunStatus;

use super::ORG;

use super::{call, encounter_args, harness, request, submit_results};

#[tokio::test]
async fn repeated_key_returns_the_existing_run() {
	let harness = harness(vec![
		call("draft_encounter", encounter_args()),
		submit_results("Encounter drafted."),
	]);
	let req = request("Create an encounter for today's session with P1", Some("client-key-1"));
	let first = harness.service.submit_intent(req.clone()).await.expect("First submit failed.");
	let second = harness.service.submit_intent(req).await.expect("Second submit failed.");

	assert!(first.created);
	assert!(!second.created);
	assert_eq!(first.run_id, second.run_id);
	assert_eq!(second.status, RunStatus::ReadyToCommit);
	assert_eq!(second.proposed_actions.as_ref().map(Vec::len), Some(1));
	assert_eq!(harness.reasoner.calls(), 2);
}

#[tokio::test]
async fn spacing_differences_still_count_as_the_same_request() {
	let harness = harness(vec![
		call("draft_encounter", encounter_args()),
		submit_results("Encounter drafted."),
	]);
	let first = harness
		.service
		.submit_intent(request("Create an encounter  for P1", Some("k")))
		.await
		.expect("First submit failed.");
	let second = harness
		.service
		.submit_intent(request(" Create an encounter for P1 ", Some("k")))
		.await
		.expect("Second submit failed.");

	assert_eq!(first.run_id, second.run_id);
	assert!(!second.created);
}

#[tokio::test]
async fn reusing_a_key_for_different_text_conflicts() {
	let harness = harness(vec![
		call("draft_encounter", encounter_args()),
		submit_results("Encounter drafted."),
	]);

	harness
		.service
		.submit_intent(request("Create an encounter for P1", Some("k")))
		.await
		.expect("First submit failed.");

	let err = harness
		.service
		.submit_intent(request("Bill the session for P1", Some("k")))
		.await
		.expect_err("Key reuse should conflict.");

	assert!(super::is_conflict(&err, RunStatus::ReadyToCommit));
	assert_eq!(harness.reasoner.calls(), 2);
}

#[tokio::test]
async fn a_failed_run_frees_its_key() {
	let harness = harness(vec![super::Scripted::Fail("upstream unavailable".to_string())]);
	let req = request("Create an encounter for P1", Some("k"));
	let failed = harness.service.submit_intent(req.clone()).await.expect("First submit failed.");

	assert_eq!(failed.status, RunStatus::Failed);

	harness.reasoner.push(vec![
		call("draft_encounter", encounter_args()),
		submit_results("Encounter drafted."),
	]);

	let retried = harness.service.submit_intent(req).await.expect("Retry failed.");

	assert!(retried.created);
	assert_ne!(retried.run_id, failed.run_id);
	assert_eq!(retried.status, RunStatus::ReadyToCommit);
}

#[tokio::test]
async fn concurrent_submissions_with_one_key_drive_a_single_run() {
	let harness = harness(vec![
		call("draft_encounter", encounter_args()),
		submit_results("Encounter drafted."),
	]);
	let req = request("Create an encounter for today's session with P1", Some("client-key-2"));
	let (first, second) = tokio::join!(
		harness.service.submit_intent(req.clone()),
		harness.service.submit_intent(req),
	);
	let first = first.expect("First submit failed.");
	let second = second.expect("Second submit failed.");

	assert_eq!(first.run_id, second.run_id);
	assert_eq!([first.created, second.created].iter().filter(|created| **created).count(), 1);
	assert_eq!(harness.reasoner.calls(), 2);

	let detail = harness.service.get_run(ORG, first.run_id).await.expect("get_run failed.");

	assert_eq!(detail.run.status, RunStatus::ReadyToCommit);
	assert_eq!(detail.actions.len(), 1);
}
