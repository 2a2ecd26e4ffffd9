use scribe_domain::run::{RunStatus, StepKind};
use scribe_providers::reasoner::Turn;
use scribe_service::{Error, RespondRequest};

use super::{ORG, Scripted, appointment_args, call, harness, submit, submit_results};

fn respond(clarification_id: uuid::Uuid, answer: &str) -> RespondRequest {
	RespondRequest { org_id: ORG.to_string(), clarification_id, answer: answer.to_string() }
}

#[tokio::test]
async fn run_resumes_only_after_every_question_is_answered() {
	let harness = harness(vec![call(
		"ask_clarification",
		serde_json::json!({
			"questions": [
				{ "question": "Which day next week?" },
				{ "question": "Which appointment type?", "options": ["Follow-up", "Intake", "follow-up"] },
			],
		}),
	)]);
	let suspended = submit(&harness, "Schedule a follow-up for P1 next week").await;

	assert_eq!(suspended.status, RunStatus::NeedsClarification);
	assert_eq!(harness.reasoner.calls(), 1);

	let questions = suspended.clarifications.expect("Open questions should be listed.");

	assert_eq!(questions.len(), 2);
	assert_eq!(questions[1].options, vec!["Follow-up".to_string(), "Intake".to_string()]);

	let partial = harness
		.service
		.respond_clarification(respond(questions[0].clarification_id, "Monday at 3pm"))
		.await
		.expect("First answer failed.");

	assert_eq!(partial.status, RunStatus::NeedsClarification);
	assert_eq!(partial.clarifications.as_ref().map(Vec::len), Some(1));
	assert_eq!(harness.reasoner.calls(), 1);

	let err = harness
		.service
		.respond_clarification(respond(questions[1].clarification_id, "Group session"))
		.await
		.expect_err("Answers outside the options should be refused.");

	assert!(matches!(err, Error::InvalidRequest { .. }));

	harness.reasoner.push(vec![
		call("draft_appointment", appointment_args()),
		submit_results("Follow-up drafted."),
	]);

	let resumed = harness
		.service
		.respond_clarification(respond(questions[1].clarification_id, "follow-up"))
		.await
		.expect("Second answer failed.");

	assert_eq!(resumed.status, RunStatus::ReadyToCommit);
	assert_eq!(harness.reasoner.calls(), 3);

	let resumed_turns = harness.reasoner.last_turns();

	assert!(resumed_turns.iter().any(|turn| matches!(
		turn,
		Turn::User { content } if content.contains("Monday at 3pm") && content.contains("Follow-up")
	)));
	assert!(resumed_turns.iter().any(|turn| matches!(turn, Turn::ToolResult { .. })));

	let detail = harness.service.get_run(ORG, resumed.run_id).await.expect("get_run failed.");

	assert!(detail.steps.iter().any(|step| step.kind == StepKind::ClarificationAnswers));
	assert!(detail.clarifications.iter().all(|clarification| clarification.answer.is_some()));
}

#[tokio::test]
async fn answering_after_resume_is_a_conflict() {
	let harness = harness(vec![
		call("ask_clarification", serde_json::json!({ "questions": [{ "question": "Which day?" }] })),
		call("draft_appointment", appointment_args()),
		submit_results("Follow-up drafted."),
	]);
	let suspended = submit(&harness, "Schedule a follow-up for P1").await;
	let question = suspended.clarifications.expect("Open questions should be listed.")[0].clarification_id;
	let resumed = harness
		.service
		.respond_clarification(respond(question, "Monday"))
		.await
		.expect("Answer failed.");

	assert_eq!(resumed.status, RunStatus::ReadyToCommit);

	let err = harness
		.service
		.respond_clarification(respond(question, "Tuesday"))
		.await
		.expect_err("A late answer should conflict.");

	assert!(super::is_conflict(&err, RunStatus::ReadyToCommit));
}

#[tokio::test]
async fn too_many_questions_fail_the_run() {
	let mut cfg = super::test_config();

	cfg.agent.max_clarifications = 1;

	let harness = super::harness_with(
		cfg,
		vec![call(
			"ask_clarification",
			serde_json::json!({ "questions": [{ "question": "Which day?" }, { "question": "Which time?" }] }),
		)],
	);
	let outcome = submit(&harness, "Schedule a follow-up for P1").await;

	assert_eq!(outcome.status, RunStatus::Failed);
	assert!(outcome.error_message.unwrap_or_default().contains("ask_clarification"));
}

fn one_question() -> Scripted {
	call("ask_clarification", serde_json::json!({ "questions": [{ "question": "Which day?" }] }))
}

#[tokio::test]
async fn a_failed_resume_fails_the_run() {
	let harness = harness(vec![one_question()]);
	let suspended = submit(&harness, "Schedule a follow-up for P1").await;
	let question = suspended.clarifications.expect("Open questions should be listed.")[0].clarification_id;

	harness.store.fail_on_step(StepKind::ClarificationAnswers);

	let err = harness
		.service
		.respond_clarification(respond(question, "Monday"))
		.await
		.expect_err("The answers step could not be written.");

	assert!(matches!(err, Error::Storage { .. }));
	assert_eq!(harness.reasoner.calls(), 1);

	let detail = harness.service.get_run(ORG, suspended.run_id).await.expect("get_run failed.");

	assert_eq!(detail.run.status, RunStatus::Failed);
	assert!(detail.run.error_message.unwrap_or_default().contains("Could not resume"));
}

#[tokio::test]
async fn concurrent_final_answers_resume_the_run_once() {
	let harness = harness(vec![
		one_question(),
		call("draft_appointment", appointment_args()),
		submit_results("Follow-up drafted."),
	]);
	let suspended = submit(&harness, "Schedule a follow-up for P1").await;
	let question = suspended.clarifications.expect("Open questions should be listed.")[0].clarification_id;
	let (first, second) = tokio::join!(
		harness.service.respond_clarification(respond(question, "Monday")),
		harness.service.respond_clarification(respond(question, "Monday")),
	);
	let (resumed, lost): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);

	assert_eq!(resumed.len(), 1);
	assert!(lost.iter().all(|outcome| matches!(outcome, Err(Error::Conflict { .. }))));
	assert_eq!(harness.reasoner.calls(), 3);

	let detail = harness.service.get_run(ORG, suspended.run_id).await.expect("get_run failed.");

	assert_eq!(detail.run.status, RunStatus::ReadyToCommit);
	assert_eq!(
		detail.steps.iter().filter(|step| step.kind == StepKind::ClarificationAnswers).count(),
		1
	);
	assert_eq!(detail.actions.len(), 1);
}

#[tokio::test]
async fn a_second_batch_hands_back_only_its_own_answers() {
	let harness = harness(vec![one_question()]);
	let suspended = submit(&harness, "Schedule a follow-up for P1").await;
	let first = suspended.clarifications.expect("Open questions should be listed.")[0].clarification_id;

	harness.reasoner.push(vec![call(
		"ask_clarification",
		serde_json::json!({ "questions": [{ "question": "Which time?" }] }),
	)]);

	let again = harness
		.service
		.respond_clarification(respond(first, "Monday"))
		.await
		.expect("First answer failed.");

	assert_eq!(again.status, RunStatus::NeedsClarification);

	let second = again.clarifications.expect("Open questions should be listed.")[0].clarification_id;

	harness.reasoner.push(vec![
		call("draft_appointment", appointment_args()),
		submit_results("Follow-up drafted."),
	]);

	let resumed = harness
		.service
		.respond_clarification(respond(second, "3pm"))
		.await
		.expect("Second answer failed.");

	assert_eq!(resumed.status, RunStatus::ReadyToCommit);

	let answer_turns: Vec<String> = harness
		.reasoner
		.last_turns()
		.into_iter()
		.filter_map(|turn| match turn {
			Turn::User { content } if content.contains("answered your questions") => Some(content),
			_ => None,
		})
		.collect();

	assert_eq!(answer_turns.len(), 2);
	assert!(answer_turns[0].contains("Monday"));
	assert!(answer_turns[1].contains("3pm"));
	assert!(!answer_turns[1].contains("Monday"));
}
