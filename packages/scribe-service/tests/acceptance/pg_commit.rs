use std::sync::Arc;

use scribe_config::Postgres;
use scribe_domain::run::RunStatus;
use scribe_service::{CommitRequest, Providers, ScribeService, SubmitIntentRequest};
use scribe_storage::{db::Db, pg::PgStore, store::RunStore};
use scribe_testkit::TestDatabase;

use super::{
	CLINICIAN, ORG, ScriptedReasoner, call, encounter_args, note_args, submit_results, test_config,
};

#[tokio::test]
#[ignore = "Requires external Postgres. Set SCRIBE_PG_DSN to run."]
async fn staged_group_commits_against_postgres() {
	let Some(dsn) = scribe_testkit::env_dsn() else {
		eprintln!("Skipping staged_group_commits_against_postgres; set SCRIBE_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&dsn).await.expect("Failed to create test database.");
	let db = Db::connect(&Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 2 })
		.await
		.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	let store = Arc::new(PgStore::new(db));
	let reasoner = Arc::new(ScriptedReasoner::new(vec![
		call("draft_progress_note", note_args(&[], &[])),
		call("draft_encounter", encounter_args()),
		submit_results("Encounter and note drafted."),
	]));
	let service = ScribeService::with_providers(
		test_config(),
		store.clone() as Arc<dyn RunStore>,
		Providers::new(reasoner),
	);
	let req = SubmitIntentRequest {
		org_id: ORG.to_string(),
		user_id: CLINICIAN.to_string(),
		text: "Document today's session with P1".to_string(),
		patient_id: Some("P1".to_string()),
		encounter_id: None,
		idempotency_key: Some("pg-acceptance".to_string()),
	};
	let staged = service.submit_intent(req.clone()).await.expect("submit_intent failed.");
	let replay = service.submit_intent(req).await.expect("Replay failed.");

	assert_eq!(staged.status, RunStatus::ReadyToCommit);
	assert_eq!(replay.run_id, staged.run_id);

	let committed = service
		.commit_run(CommitRequest {
			org_id: ORG.to_string(),
			user_id: CLINICIAN.to_string(),
			run_id: staged.run_id,
		})
		.await
		.expect("commit_run failed.");

	assert!(committed.committed);
	assert_eq!(committed.records.len(), 2);

	let records = store.patient_records(ORG, "P1", 10).await.expect("patient_records failed.");
	let encounter = records
		.iter()
		.find(|record| record.table == scribe_domain::action::TargetTable::Encounters)
		.expect("Encounter row missing.");
	let note = records
		.iter()
		.find(|record| record.table == scribe_domain::action::TargetTable::ClinicalNotes)
		.expect("Note row missing.");

	assert_eq!(note.encounter_id.as_deref(), Some(encounter.id.to_string().as_str()));
	assert_eq!(service.audit_trail(ORG, staged.run_id).await.expect("audit_trail failed.").len(), 2);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
