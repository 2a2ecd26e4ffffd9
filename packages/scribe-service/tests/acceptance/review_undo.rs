use scribe_domain::run::RunStatus;
use scribe_service::{Error, PatchActionRequest, UndoRequest};

use super::{ORG, call, harness_with, note_args, submit, submit_results, test_config};

#[tokio::test]
async fn undo_walks_back_through_edits() {
	let mut cfg = test_config();

	cfg.agent.undo_depth = 2;

	let harness = harness_with(
		cfg,
		vec![call("draft_progress_note", note_args(&[], &[])), submit_results("Note drafted.")],
	);
	let staged = submit(&harness, "Write a progress note for today's session with P1").await;
	let action = staged.proposed_actions.expect("Actions should be staged.").remove(0);
	let edit = |body: &str| {
		let mut payload = action.payload.clone();

		payload["sections"][0]["body"] = serde_json::json!(body);

		PatchActionRequest {
			org_id: ORG.to_string(),
			run_id: staged.run_id,
			action_id: action.action_id,
			provider_modified_payload: Some(payload),
		}
	};
	let undo = || UndoRequest { org_id: ORG.to_string(), run_id: staged.run_id, action_id: action.action_id };

	for body in ["First edit.", "Second edit.", "Third edit."] {
		harness.service.patch_action(edit(body)).await.expect("patch_action failed.");
	}

	let first_undo = harness.service.undo_action_edit(undo()).await.expect("First undo failed.");

	assert_eq!(first_undo.undo_depth, 1);
	assert_eq!(
		first_undo.action.provider_modified_payload.as_ref().map(|p| p["sections"][0]["body"].clone()),
		Some(serde_json::json!("Second edit."))
	);

	let second_undo = harness.service.undo_action_edit(undo()).await.expect("Second undo failed.");

	assert_eq!(second_undo.undo_depth, 0);
	assert_eq!(
		second_undo.action.provider_modified_payload.as_ref().map(|p| p["sections"][0]["body"].clone()),
		Some(serde_json::json!("First edit."))
	);

	let err = harness.service.undo_action_edit(undo()).await.expect_err("History is exhausted.");

	assert!(super::is_conflict(&err, RunStatus::ReadyToCommit));
}

#[tokio::test]
async fn clearing_the_override_can_be_undone() {
	let harness = harness_with(
		test_config(),
		vec![call("draft_progress_note", note_args(&[], &[])), submit_results("Note drafted.")],
	);
	let staged = submit(&harness, "Write a progress note for today's session with P1").await;
	let action = staged.proposed_actions.expect("Actions should be staged.").remove(0);
	let mut payload = action.payload.clone();

	payload["format"] = serde_json::json!("dap");

	let patch = |payload: Option<serde_json::Value>| PatchActionRequest {
		org_id: ORG.to_string(),
		run_id: staged.run_id,
		action_id: action.action_id,
		provider_modified_payload: payload,
	};

	harness.service.patch_action(patch(Some(payload))).await.expect("patch_action failed.");

	let cleared = harness.service.patch_action(patch(None)).await.expect("Clearing failed.");

	assert_eq!(cleared.action.provider_modified_payload, None);
	assert_eq!(cleared.undo_depth, 2);

	let restored = harness
		.service
		.undo_action_edit(UndoRequest {
			org_id: ORG.to_string(),
			run_id: staged.run_id,
			action_id: action.action_id,
		})
		.await
		.expect("undo failed.");

	assert_eq!(
		restored.action.provider_modified_payload.as_ref().map(|p| p["format"].clone()),
		Some(serde_json::json!("dap"))
	);
}

#[tokio::test]
async fn invalid_edits_are_refused() {
	let harness = harness_with(
		test_config(),
		vec![call("draft_progress_note", note_args(&[], &[])), submit_results("Note drafted.")],
	);
	let staged = submit(&harness, "Write a progress note for today's session with P1").await;
	let action = staged.proposed_actions.expect("Actions should be staged.").remove(0);
	let err = harness
		.service
		.patch_action(PatchActionRequest {
			org_id: ORG.to_string(),
			run_id: staged.run_id,
			action_id: action.action_id,
			provider_modified_payload: Some(serde_json::json!({ "format": "soap", "sections": [] })),
		})
		.await
		.expect_err("A note without sections is invalid.");

	assert!(matches!(err, Error::InvalidRequest { .. }));

	let detail = harness.service.get_run(ORG, staged.run_id).await.expect("get_run failed.");

	assert_eq!(detail.actions[0].revision, 0);
	assert_eq!(detail.actions[0].provider_modified_payload, None);
}
