use scribe_domain::{
	run::RunStatus,
	safety::{Decision, Disposition},
};
use scribe_service::{CommitRequest, DispositionsRequest, Error, PatchActionRequest};
use scribe_storage::store::RunStore;

use super::{CLINICIAN, ORG, PATIENT, call, harness, note_args, submit, submit_results};

fn disposition(item: &str, decision: Decision, adjusted_code: Option<&str>) -> Disposition {
	Disposition {
		item: item.to_string(),
		decision,
		adjusted_code: adjusted_code.map(ToString::to_string),
	}
}

#[tokio::test]
async fn gated_items_block_commit_until_every_one_has_a_disposition() {
	let harness = harness(vec![
		call("draft_progress_note", note_args(&["F33.1", "F41.1"], &[])),
		submit_results("Note drafted with working diagnoses."),
	]);
	let staged = submit(
		&harness,
		"Write a progress note for today's session with P1. Client reported suicidal thoughts this week.",
	)
	.await;
	let action = staged.proposed_actions.expect("Actions should be staged.").remove(0);

	assert_eq!(
		action.gate_items,
		vec![
			"diagnosis:F33.1".to_string(),
			"diagnosis:F41.1".to_string(),
			"risk:suicidal_ideation".to_string(),
		]
	);
	assert!(action.assumptions.iter().any(|assumption| assumption.contains("suicidal_ideation")));

	let commit = || CommitRequest {
		org_id: ORG.to_string(),
		user_id: CLINICIAN.to_string(),
		run_id: staged.run_id,
	};
	let record = |dispositions: Vec<Disposition>| DispositionsRequest {
		org_id: ORG.to_string(),
		run_id: staged.run_id,
		action_id: action.action_id,
		dispositions,
	};
	let err = harness.service.commit_run(commit()).await.expect_err("Ungated commit should fail.");

	assert!(super::is_conflict(&err, RunStatus::ReadyToCommit));
	assert_eq!(harness.store.clinical_row_count(), 0);

	let err = harness
		.service
		.record_dispositions(record(vec![disposition("diagnosis:F33.1", Decision::Acknowledge, None)]))
		.await
		.expect_err("Diagnoses cannot be acknowledged.");

	assert!(matches!(err, Error::InvalidRequest { .. }));

	let err = harness
		.service
		.record_dispositions(record(vec![disposition("diagnosis:F90.0", Decision::Accept, None)]))
		.await
		.expect_err("Only gated items take dispositions.");

	assert!(matches!(err, Error::InvalidRequest { .. }));

	let partial = harness
		.service
		.record_dispositions(record(vec![
			disposition("diagnosis:f33.1", Decision::Adjust, Some("F33.2")),
			disposition("diagnosis:F41.1", Decision::Defer, None),
		]))
		.await
		.expect("record_dispositions failed.");

	assert_eq!(partial.action.missing_dispositions, vec!["risk:suicidal_ideation".to_string()]);

	let err = harness.service.commit_run(commit()).await.expect_err("Risk flag is still open.");

	assert!(matches!(&err, Error::Conflict { message, .. } if message.contains("risk:suicidal_ideation")));

	harness
		.service
		.record_dispositions(record(vec![disposition(
			"risk:suicidal_ideation",
			Decision::Acknowledge,
			None,
		)]))
		.await
		.expect("record_dispositions failed.");

	let committed = harness.service.commit_run(commit()).await.expect("commit_run failed.");

	assert!(committed.committed);

	let records = harness.store.patient_records(ORG, PATIENT, 10).await.expect("patient_records failed.");
	let diagnoses = records[0].body["diagnoses"].as_array().cloned().unwrap_or_default();

	assert_eq!(diagnoses.len(), 1);
	assert_eq!(diagnoses[0]["code"], serde_json::json!("F33.2"));
	assert_eq!(records[0].body["risk_flags"], serde_json::json!(["suicidal_ideation"]));
}

#[tokio::test]
async fn an_edit_cannot_drop_gated_items_without_a_disposition() {
	let harness = harness(vec![
		call("draft_progress_note", note_args(&["F33.1"], &[])),
		submit_results("Note drafted with a working diagnosis."),
	]);
	let staged = submit(
		&harness,
		"Write a progress note for today's session with P1. Client reported suicidal thoughts this week.",
	)
	.await;
	let action = staged.proposed_actions.expect("Actions should be staged.").remove(0);
	let edited = harness
		.service
		.patch_action(PatchActionRequest {
			org_id: ORG.to_string(),
			run_id: staged.run_id,
			action_id: action.action_id,
			provider_modified_payload: Some(serde_json::json!({
				"format": "soap",
				"sections": [{ "heading": "Subjective", "body": "Client reports better sleep." }],
			})),
		})
		.await
		.expect("patch_action failed.");
	let gated = vec!["diagnosis:F33.1".to_string(), "risk:suicidal_ideation".to_string()];

	assert_eq!(edited.action.gate_items, gated);
	assert_eq!(edited.action.missing_dispositions, gated);

	let commit = || CommitRequest {
		org_id: ORG.to_string(),
		user_id: CLINICIAN.to_string(),
		run_id: staged.run_id,
	};
	let err = harness.service.commit_run(commit()).await.expect_err("Dropped items are still gated.");

	assert!(super::is_conflict(&err, RunStatus::ReadyToCommit));
	assert_eq!(harness.store.clinical_row_count(), 0);
	assert!(harness.service.audit_trail(ORG, staged.run_id).await.expect("audit_trail failed.").is_empty());

	harness
		.service
		.record_dispositions(DispositionsRequest {
			org_id: ORG.to_string(),
			run_id: staged.run_id,
			action_id: action.action_id,
			dispositions: vec![
				disposition("diagnosis:F33.1", Decision::Defer, None),
				disposition("risk:suicidal_ideation", Decision::Acknowledge, None),
			],
		})
		.await
		.expect("Dispositions for dropped items should be accepted.");

	let committed = harness.service.commit_run(commit()).await.expect("commit_run failed.");

	assert!(committed.committed);
	assert_eq!(committed.status, RunStatus::Committed);
}
