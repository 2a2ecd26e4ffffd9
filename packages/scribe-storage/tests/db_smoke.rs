use tokio::runtime::Runtime;
use uuid::Uuid;

use scribe_config::Postgres;
use scribe_domain::{
	action::{ActionStatus, ActionType, TargetTable},
	run::RunStatus,
};
use scribe_storage::{
	Error,
	db::Db,
	models::{ClinicalWrite, CommitPlan, NewAction, NewRun},
	pg::PgStore,
	store::RunStore,
};
use scribe_testkit::TestDatabase;

fn new_run(key: Option<&str>) -> NewRun {
	NewRun {
		org_id: "org-a".to_string(),
		user_id: "clinician-1".to_string(),
		patient_id: Some("P1".to_string()),
		encounter_id: None,
		idempotency_key: key.map(ToString::to_string),
		input_fingerprint: "fp".to_string(),
		input_text: "Schedule a follow-up for P1".to_string(),
		intent_type: "scheduling".to_string(),
	}
}

async fn bootstrapped(test_db: &TestDatabase) -> PgStore {
	let cfg = Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 2 };
	let db = Db::connect(&cfg).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	PgStore::new(db)
}

#[test]
#[ignore = "Requires external Postgres. Set SCRIBE_PG_DSN to run."]
fn clinical_tables_exist_after_bootstrap() {
	let Some(dsn) = scribe_testkit::env_dsn() else {
		eprintln!("Skipping clinical_tables_exist_after_bootstrap; set SCRIBE_PG_DSN to run this test.");

		return;
	};
	let rt = Runtime::new().expect("Failed to build runtime.");

	rt.block_on(async {
		let test_db = TestDatabase::new(&dsn).await.expect("Failed to create test database.");
		let store = bootstrapped(&test_db).await;

		for table in TargetTable::ALL {
			let count: i64 = sqlx::query_scalar(
				"SELECT count(*) FROM information_schema.tables WHERE table_name = $1",
			)
			.bind(table.as_str())
			.fetch_one(&store.db.pool)
			.await
			.expect("Failed to query schema tables.");

			assert_eq!(count, 1, "missing table {table}");
		}

		// A second bootstrap is a no-op.
		store.db.ensure_schema().await.expect("Failed to re-run schema.");
		test_db.cleanup().await.expect("Failed to cleanup test database.");
	});
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set SCRIBE_PG_DSN to run."]
async fn idempotency_key_returns_the_live_run() {
	let Some(base_dsn) = scribe_testkit::env_dsn() else {
		eprintln!("Skipping idempotency_key_returns_the_live_run; set SCRIBE_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let store = bootstrapped(&test_db).await;
	let first = store.create_run(new_run(Some("k1"))).await.expect("create failed");
	let replay = store.create_run(new_run(Some("k1"))).await.expect("create failed");

	assert!(first.created);
	assert!(!replay.created);
	assert_eq!(first.run.id, replay.run.id);

	store
		.transition(first.run.id, &[RunStatus::Pending], RunStatus::Failed, Some("provider down"))
		.await
		.expect("fail failed");

	let fresh = store.create_run(new_run(Some("k1"))).await.expect("create failed");

	assert!(fresh.created);
	assert_ne!(fresh.run.id, first.run.id);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set SCRIBE_PG_DSN to run."]
async fn commit_writes_rows_and_audit_in_one_transaction() {
	let Some(base_dsn) = scribe_testkit::env_dsn() else {
		eprintln!("Skipping commit_writes_rows_and_audit_in_one_transaction; set SCRIBE_PG_DSN to run.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let store = bootstrapped(&test_db).await;
	let run = store.create_run(new_run(None)).await.expect("create failed").run;

	store
		.transition(run.id, &[RunStatus::Pending], RunStatus::Running, None)
		.await
		.expect("claim failed");

	let group = Uuid::new_v4();
	let staged = store
		.stage_actions(
			run.id,
			"Follow-up appointment",
			vec![NewAction {
				action_type: ActionType::Appointment,
				action_group: group,
				payload: serde_json::json!({ "scheduled_for": "2026-11-02T15:00:00Z" }),
				assumptions: vec!["50 minute slot".to_string()],
				confidence_score: Some(0.9),
			}],
		)
		.await
		.expect("stage failed");
	let stale = CommitPlan {
		run_id: run.id,
		org_id: run.org_id.clone(),
		actor_id: "clinician-1".to_string(),
		action_group: group,
		writes: vec![ClinicalWrite {
			action_id: staged[0].id,
			revision: staged[0].revision,
			table: TargetTable::Appointments,
			record_id: Uuid::new_v4(),
			patient_id: Some("P1".to_string()),
			encounter_id: None,
			body: staged[0].payload.clone(),
		}],
	};
	let update = store
		.update_action_payload(
			"org-a",
			run.id,
			staged[0].id,
			Some(serde_json::json!({ "scheduled_for": "2026-11-03T15:00:00Z" })),
		)
		.await
		.expect("update failed");

	assert!(matches!(store.commit_group(&stale).await, Err(Error::Conflict(_))));
	assert_eq!(
		store.get_run("org-a", run.id).await.expect("get failed").status,
		RunStatus::ReadyToCommit
	);

	let mut plan = stale.clone();

	plan.writes[0].revision = update.action.revision;
	plan.writes[0].body = update.action.effective_payload().clone();

	let receipt = store.commit_group(&plan).await.expect("commit failed");

	assert_eq!(receipt.run.status, RunStatus::Committed);
	assert_eq!(receipt.records.len(), 1);
	assert_eq!(receipt.audit.len(), 1);
	assert_eq!(receipt.audit[0].record_id, receipt.records[0].id);

	let detail = store.run_detail("org-a", run.id).await.expect("detail failed");

	assert_eq!(detail.actions[0].status, ActionStatus::Committed);

	let records = store.patient_records("org-a", "P1", 10).await.expect("records failed");

	assert_eq!(records.len(), 1);
	assert_eq!(records[0].body["scheduled_for"], "2026-11-03T15:00:00Z");
	assert!(matches!(store.get_run("org-b", run.id).await, Err(Error::NotFound(_))));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
