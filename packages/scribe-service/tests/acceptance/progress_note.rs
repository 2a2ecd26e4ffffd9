//! The everyday path: a clinician dictates a session, edits the drafted note, and commits it.

use scribe_domain::{
	action::{ActionType, TargetTable},
	run::RunStatus,
};
use scribe_service::{CommitRequest, PatchActionRequest};
use scribe_storage::store::RunStore;

use super::{CLINICIAN, ORG, PATIENT, call, harness, note_args, submit, submit_results};

#[tokio::test]
async fn drafted_note_is_edited_and_committed() {
	let harness = harness(vec![
		call("get_patient_context", serde_json::json!({})),
		call("draft_progress_note", note_args(&[], &[])),
		submit_results("Progress note drafted for the 53 minute session."),
	]);
	let staged = submit(
		&harness,
		"Generate a progress note for today's 53 minute session with P1. Client reports better sleep.",
	)
	.await;

	assert!(staged.created);
	assert_eq!(staged.status, RunStatus::ReadyToCommit);
	assert_eq!(staged.summary.as_deref(), Some("Progress note drafted for the 53 minute session."));

	let actions = staged.proposed_actions.expect("Actions should be staged.");

	assert_eq!(actions.len(), 1);
	assert_eq!(actions[0].action_type, ActionType::NoteDraft);
	assert_eq!(actions[0].assumptions, vec!["Session format assumed to be SOAP.".to_string()]);
	assert_eq!(actions[0].confidence_score, Some(0.8));
	assert!(actions[0].gate_items.is_empty());

	let mut edited = actions[0].payload.clone();

	edited["sections"][1]["body"] = serde_json::json!("Continue weekly CBT; add sleep diary.");

	let patched = harness
		.service
		.patch_action(PatchActionRequest {
			org_id: ORG.to_string(),
			run_id: staged.run_id,
			action_id: actions[0].action_id,
			provider_modified_payload: Some(edited),
		})
		.await
		.expect("patch_action failed.");

	assert!(patched.success);
	assert_eq!(patched.undo_depth, 1);
	assert_eq!(patched.action.revision, 1);

	let committed = harness
		.service
		.commit_run(CommitRequest {
			org_id: ORG.to_string(),
			user_id: CLINICIAN.to_string(),
			run_id: staged.run_id,
		})
		.await
		.expect("commit_run failed.");

	assert!(committed.committed);
	assert_eq!(committed.records.len(), 1);
	assert_eq!(committed.records[0].table, TargetTable::ClinicalNotes);

	let records = harness.store.patient_records(ORG, PATIENT, 10).await.expect("patient_records failed.");

	assert_eq!(records.len(), 1);
	assert_eq!(records[0].created_by, CLINICIAN);
	assert_eq!(
		records[0].body["sections"][1]["body"],
		serde_json::json!("Continue weekly CBT; add sleep diary.")
	);

	let audit = harness.service.audit_trail(ORG, staged.run_id).await.expect("audit_trail failed.");

	assert_eq!(audit.len(), 1);
	assert_eq!(audit[0].record_id, records[0].id);
	assert_eq!(audit[0].action_id, actions[0].action_id);
}

#[tokio::test]
async fn committed_records_feed_the_next_run_context() {
	let harness = harness(vec![
		call("draft_progress_note", note_args(&[], &[])),
		submit_results("Note drafted."),
	]);
	let first = submit(&harness, "Write a progress note for today's session with P1").await;

	harness
		.service
		.commit_run(CommitRequest {
			org_id: ORG.to_string(),
			user_id: CLINICIAN.to_string(),
			run_id: first.run_id,
		})
		.await
		.expect("commit_run failed.");
	harness.reasoner.push(vec![
		call("get_patient_context", serde_json::json!({})),
		submit_results("Reviewed history."),
	]);

	submit(&harness, "Review the chart for P1 before the next session").await;

	let turns = harness.reasoner.last_turns();
	let context = turns.iter().find_map(|turn| match turn {
		scribe_providers::reasoner::Turn::ToolResult { content, .. } => Some(content.clone()),
		_ => None,
	});
	let context = context.expect("Context lookup should have a result.");

	assert_eq!(context["records"].as_array().map(Vec::len), Some(1));
	assert_eq!(context["records"][0]["table"], serde_json::json!("clinical_notes"));
}
