use scribe_domain::run::{RunStatus, StepKind};

use super::{ORG, Scripted, harness, harness_with, submit, test_config};

#[tokio::test]
async fn a_hung_call_times_out_and_fails_the_run() {
	let mut cfg = test_config();

	cfg.agent.call_timeout_ms = 50;

	let harness = harness_with(cfg, vec![Scripted::Hang]);
	let outcome = submit(&harness, "Write a progress note for P1").await;

	assert_eq!(outcome.status, RunStatus::Failed);
	assert!(outcome.error_message.unwrap_or_default().contains("timed out after 50 ms"));

	let detail = harness.service.get_run(ORG, outcome.run_id).await.expect("get_run failed.");

	assert_eq!(detail.steps.last().map(|step| step.kind), Some(StepKind::Error));
}

#[tokio::test]
async fn a_provider_error_is_recorded_not_returned() {
	let harness = harness(vec![Scripted::Fail("upstream returned 503".to_string())]);
	let outcome = submit(&harness, "Write a progress note for P1").await;

	assert_eq!(outcome.status, RunStatus::Failed);
	assert!(outcome.error_message.unwrap_or_default().contains("upstream returned 503"));
	assert!(outcome.poll_after_ms.is_none());
}

#[tokio::test]
async fn a_malformed_draft_fails_the_run() {
	let harness = harness(vec![super::call(
		"draft_appointment",
		serde_json::json!({ "starts_at": "", "duration_minutes": 50, "appointment_type": "follow_up" }),
	)]);
	let outcome = submit(&harness, "Schedule a follow-up for P1").await;

	assert_eq!(outcome.status, RunStatus::Failed);
	assert!(outcome.error_message.unwrap_or_default().contains("draft_appointment"));
}
