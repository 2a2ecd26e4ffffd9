use scribe_domain::run::{RunStatus, StepKind};

use super::{ORG, call, harness_with, submit, test_config};

#[tokio::test]
async fn a_model_that_never_submits_is_stopped() {
	let mut cfg = test_config();

	cfg.agent.max_iterations = 3;

	let harness = harness_with(cfg, Vec::new());
	let outcome = submit(&harness, "Write a progress note for P1").await;

	assert_eq!(outcome.status, RunStatus::Failed);
	assert!(outcome.error_message.unwrap_or_default().contains("Step limit exceeded"));
	assert_eq!(harness.reasoner.calls(), 3);

	let detail = harness.service.get_run(ORG, outcome.run_id).await.expect("get_run failed.");

	assert_eq!(detail.steps.len(), 3);
	assert!(detail.steps.iter().all(|step| step.kind == StepKind::Reasoning));
	assert_eq!(detail.run.input_tokens, 30);
	assert_eq!(detail.run.output_tokens, 15);
}

#[tokio::test]
async fn the_bound_spans_clarification_resumes() {
	let mut cfg = test_config();

	cfg.agent.max_iterations = 2;

	let harness = harness_with(
		cfg,
		vec![
			call("get_patient_context", serde_json::json!({})),
			call("ask_clarification", serde_json::json!({ "questions": [{ "question": "Which day?" }] })),
		],
	);
	let suspended = submit(&harness, "Schedule a follow-up for P1").await;

	assert_eq!(suspended.status, RunStatus::NeedsClarification);

	let question = suspended.clarifications.expect("Open questions should be listed.")[0].clarification_id;
	let resumed = harness
		.service
		.respond_clarification(scribe_service::RespondRequest {
			org_id: ORG.to_string(),
			clarification_id: question,
			answer: "Monday".to_string(),
		})
		.await
		.expect("Answer failed.");

	assert_eq!(resumed.status, RunStatus::Failed);
	assert_eq!(harness.reasoner.calls(), 2);
}

#[tokio::test]
async fn an_unknown_tool_fails_the_run_with_an_error_step() {
	let harness = super::harness(vec![call("delete_patient", serde_json::json!({}))]);
	let outcome = submit(&harness, "Write a progress note for P1").await;

	assert_eq!(outcome.status, RunStatus::Failed);
	assert!(outcome.error_message.unwrap_or_default().contains("delete_patient"));

	let detail = harness.service.get_run(ORG, outcome.run_id).await.expect("get_run failed.");

	assert_eq!(detail.steps.len(), 1);
	assert_eq!(detail.steps[0].kind, StepKind::Error);
	assert_eq!(detail.steps[0].tool_name.as_deref(), Some("delete_patient"));
}
