//! Postgres [`RunStore`].
//!
//! Status changes are `UPDATE ... WHERE status = ANY($n)`; a missing row after the update means the
//! run was not in an allowed status (or does not exist) and is reported as such. Multi-row
//! operations run in one transaction and roll back when dropped without commit.

use serde_json::Value;
use sqlx::{PgConnection, types::Json};
use time::OffsetDateTime;
use uuid::Uuid;

use scribe_domain::{
	action::TargetTable,
	run::{RunStatus, StepKind},
	safety::Disposition,
};

use crate::{
	Error, Result,
	db::Db,
	models::{
		AnswerOutcome, AuditEntry, Clarification, ClinicalRecord, CommitPlan, CommitReceipt,
		CreateRunOutcome, NewAction, NewClarification, NewRun, NewStep, PayloadUpdate,
		ProposedAction, Run, RunDetail, Step,
	},
	store::{self, BoxFuture, RUN_NOT_FOUND, RunStore},
};

const RUN_COLUMNS: &str = "\
id, org_id, user_id, patient_id, encounter_id, idempotency_key, input_fingerprint, input_text, \
intent_type, status, error_message, summary, rejection_reason, input_tokens, output_tokens, \
created_at, updated_at";
const STEP_COLUMNS: &str = "\
id, run_id, seq, kind, tool_name, call_id, tool_input, tool_output, text, input_tokens, \
output_tokens, created_at";
const CLARIFICATION_COLUMNS: &str =
	"id, run_id, seq, question, options, answer, created_at, answered_at";
const ACTION_COLUMNS: &str = "\
id, run_id, seq, action_type, action_group, payload, provider_modified_payload, status, \
assumptions, confidence_score, dispositions, revision, created_at, updated_at";
const AUDIT_COLUMNS: &str =
	"id, org_id, run_id, action_id, actor_id, target_table, record_id, operation, created_at";

#[derive(sqlx::FromRow)]
struct RunRow {
	id: Uuid,
	org_id: String,
	user_id: String,
	patient_id: Option<String>,
	encounter_id: Option<String>,
	idempotency_key: Option<String>,
	input_fingerprint: String,
	input_text: String,
	intent_type: String,
	status: String,
	error_message: Option<String>,
	summary: Option<String>,
	rejection_reason: Option<String>,
	input_tokens: i64,
	output_tokens: i64,
	created_at: OffsetDateTime,
	updated_at: OffsetDateTime,
}
impl TryFrom<RunRow> for Run {
	type Error = Error;

	fn try_from(row: RunRow) -> Result<Self> {
		Ok(Self {
			id: row.id,
			org_id: row.org_id,
			user_id: row.user_id,
			patient_id: row.patient_id,
			encounter_id: row.encounter_id,
			idempotency_key: row.idempotency_key,
			input_fingerprint: row.input_fingerprint,
			input_text: row.input_text,
			intent_type: row.intent_type,
			status: row.status.parse()?,
			error_message: row.error_message,
			summary: row.summary,
			rejection_reason: row.rejection_reason,
			input_tokens: row.input_tokens,
			output_tokens: row.output_tokens,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(sqlx::FromRow)]
struct StepRow {
	id: Uuid,
	run_id: Uuid,
	seq: i32,
	kind: String,
	tool_name: Option<String>,
	call_id: Option<String>,
	tool_input: Option<Value>,
	tool_output: Option<Value>,
	text: Option<String>,
	input_tokens: i64,
	output_tokens: i64,
	created_at: OffsetDateTime,
}
impl TryFrom<StepRow> for Step {
	type Error = Error;

	fn try_from(row: StepRow) -> Result<Self> {
		Ok(Self {
			id: row.id,
			run_id: row.run_id,
			seq: row.seq,
			kind: row.kind.parse()?,
			tool_name: row.tool_name,
			call_id: row.call_id,
			tool_input: row.tool_input,
			tool_output: row.tool_output,
			text: row.text,
			input_tokens: row.input_tokens,
			output_tokens: row.output_tokens,
			created_at: row.created_at,
		})
	}
}

#[derive(sqlx::FromRow)]
struct ClarificationRow {
	id: Uuid,
	run_id: Uuid,
	seq: i32,
	question: String,
	options: Json<Vec<String>>,
	answer: Option<String>,
	created_at: OffsetDateTime,
	answered_at: Option<OffsetDateTime>,
}
impl From<ClarificationRow> for Clarification {
	fn from(row: ClarificationRow) -> Self {
		Self {
			id: row.id,
			run_id: row.run_id,
			seq: row.seq,
			question: row.question,
			options: row.options.0,
			answer: row.answer,
			created_at: row.created_at,
			answered_at: row.answered_at,
		}
	}
}

#[derive(sqlx::FromRow)]
struct ActionRow {
	id: Uuid,
	run_id: Uuid,
	seq: i32,
	action_type: String,
	action_group: Uuid,
	payload: Value,
	provider_modified_payload: Option<Value>,
	status: String,
	assumptions: Json<Vec<String>>,
	confidence_score: Option<f64>,
	dispositions: Json<Vec<Disposition>>,
	revision: i32,
	created_at: OffsetDateTime,
	updated_at: OffsetDateTime,
}
impl TryFrom<ActionRow> for ProposedAction {
	type Error = Error;

	fn try_from(row: ActionRow) -> Result<Self> {
		Ok(Self {
			id: row.id,
			run_id: row.run_id,
			seq: row.seq,
			action_type: row.action_type.parse()?,
			action_group: row.action_group,
			payload: row.payload,
			provider_modified_payload: row.provider_modified_payload,
			status: row.status.parse()?,
			assumptions: row.assumptions.0,
			confidence_score: row.confidence_score,
			dispositions: row.dispositions.0,
			revision: row.revision,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(sqlx::FromRow)]
struct ClinicalRow {
	target_table: String,
	id: Uuid,
	org_id: String,
	patient_id: Option<String>,
	encounter_id: Option<String>,
	run_id: Uuid,
	action_id: Uuid,
	body: Value,
	created_by: String,
	created_at: OffsetDateTime,
}
impl TryFrom<ClinicalRow> for ClinicalRecord {
	type Error = Error;

	fn try_from(row: ClinicalRow) -> Result<Self> {
		Ok(Self {
			table: row.target_table.parse()?,
			id: row.id,
			org_id: row.org_id,
			patient_id: row.patient_id,
			encounter_id: row.encounter_id,
			run_id: row.run_id,
			action_id: row.action_id,
			body: row.body,
			created_by: row.created_by,
			created_at: row.created_at,
		})
	}
}

#[derive(sqlx::FromRow)]
struct AuditRow {
	id: Uuid,
	org_id: String,
	run_id: Uuid,
	action_id: Uuid,
	actor_id: String,
	target_table: String,
	record_id: Uuid,
	operation: String,
	created_at: OffsetDateTime,
}
impl TryFrom<AuditRow> for AuditEntry {
	type Error = Error;

	fn try_from(row: AuditRow) -> Result<Self> {
		Ok(Self {
			id: row.id,
			org_id: row.org_id,
			run_id: row.run_id,
			action_id: row.action_id,
			actor_id: row.actor_id,
			target_table: row.target_table.parse()?,
			record_id: row.record_id,
			operation: row.operation,
			created_at: row.created_at,
		})
	}
}

#[derive(Clone)]
pub struct PgStore {
	pub db: Db,
}
impl PgStore {
	pub fn new(db: Db) -> Self {
		Self { db }
	}

	async fn create_run_inner(&self, new: NewRun) -> Result<CreateRunOutcome> {
		let mut conn = self.db.pool.acquire().await?;
		let sql = format!(
			"\
INSERT INTO runs (
	id, org_id, user_id, patient_id, encounter_id, idempotency_key, input_fingerprint, input_text,
	intent_type, status
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
ON CONFLICT (org_id, idempotency_key)
	WHERE idempotency_key IS NOT NULL AND status <> 'failed'
	DO NOTHING
RETURNING {RUN_COLUMNS}"
		);
		let inserted: Option<RunRow> = sqlx::query_as(&sql)
			.bind(Uuid::new_v4())
			.bind(&new.org_id)
			.bind(&new.user_id)
			.bind(&new.patient_id)
			.bind(&new.encounter_id)
			.bind(&new.idempotency_key)
			.bind(&new.input_fingerprint)
			.bind(&new.input_text)
			.bind(&new.intent_type)
			.fetch_optional(&mut *conn)
			.await?;

		if let Some(row) = inserted {
			return Ok(CreateRunOutcome { run: row.try_into()?, created: true });
		}

		let sql = format!(
			"\
SELECT {RUN_COLUMNS}
FROM runs
WHERE org_id = $1 AND idempotency_key = $2 AND status <> 'failed'"
		);
		let existing: Option<RunRow> = sqlx::query_as(&sql)
			.bind(&new.org_id)
			.bind(&new.idempotency_key)
			.fetch_optional(&mut *conn)
			.await?;
		let Some(existing) = existing else {
			return Err(Error::Conflict(
				"Idempotency key changed hands during submission; retry.".to_string(),
			));
		};

		Ok(CreateRunOutcome { run: existing.try_into()?, created: false })
	}

	async fn get_run_inner(&self, org_id: &str, run_id: Uuid) -> Result<Run> {
		let mut conn = self.db.pool.acquire().await?;

		org_run(&mut conn, org_id, run_id, "").await
	}

	async fn run_detail_inner(&self, org_id: &str, run_id: Uuid) -> Result<RunDetail> {
		let mut tx = self.db.pool.begin().await?;

		sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
			.execute(&mut *tx)
			.await?;

		let run = org_run(&mut tx, org_id, run_id, "").await?;
		let steps: Vec<StepRow> = sqlx::query_as(&format!(
			"SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = $1 ORDER BY seq"
		))
		.bind(run_id)
		.fetch_all(&mut *tx)
		.await?;
		let clarifications: Vec<ClarificationRow> = sqlx::query_as(&format!(
			"SELECT {CLARIFICATION_COLUMNS} FROM clarifications WHERE run_id = $1 ORDER BY seq"
		))
		.bind(run_id)
		.fetch_all(&mut *tx)
		.await?;
		let actions: Vec<ActionRow> = sqlx::query_as(&format!(
			"SELECT {ACTION_COLUMNS} FROM proposed_actions WHERE run_id = $1 ORDER BY seq"
		))
		.bind(run_id)
		.fetch_all(&mut *tx)
		.await?;

		tx.commit().await?;

		Ok(RunDetail {
			run,
			steps: steps.into_iter().map(Step::try_from).collect::<Result<_>>()?,
			clarifications: clarifications.into_iter().map(Clarification::from).collect(),
			actions: actions.into_iter().map(ProposedAction::try_from).collect::<Result<_>>()?,
		})
	}

	async fn transition_inner(
		&self,
		run_id: Uuid,
		from: &[RunStatus],
		to: RunStatus,
		error_message: Option<&str>,
	) -> Result<Run> {
		store::check_transition(from, to)?;

		let mut conn = self.db.pool.acquire().await?;

		cas(&mut conn, run_id, from, to, error_message).await
	}

	async fn append_step_inner(&self, run_id: Uuid, step: NewStep) -> Result<Step> {
		let mut tx = self.db.pool.begin().await?;
		let locked: Option<Uuid> = sqlx::query_scalar(
			"\
UPDATE runs
SET input_tokens = input_tokens + $2,
	output_tokens = output_tokens + $3,
	updated_at = now()
WHERE id = $1 AND status = 'running'
RETURNING id",
		)
		.bind(run_id)
		.bind(step.input_tokens)
		.bind(step.output_tokens)
		.fetch_optional(&mut *tx)
		.await?;

		if locked.is_none() {
			return Err(status_error(&mut tx, run_id, &[RunStatus::Running]).await);
		}

		let step = insert_step(&mut tx, run_id, step).await?;

		tx.commit().await?;

		Ok(step)
	}

	async fn suspend_inner(
		&self,
		run_id: Uuid,
		questions: Vec<NewClarification>,
	) -> Result<Vec<Clarification>> {
		store::validate_questions(&questions)?;

		let mut tx = self.db.pool.begin().await?;

		cas(&mut tx, run_id, &[RunStatus::Running], RunStatus::NeedsClarification, None).await?;

		let offset: i32 = sqlx::query_scalar(
			"SELECT COALESCE(MAX(seq), 0) FROM clarifications WHERE run_id = $1",
		)
		.bind(run_id)
		.fetch_one(&mut *tx)
		.await?;
		let sql = format!(
			"\
INSERT INTO clarifications (id, run_id, seq, question, options)
VALUES ($1, $2, $3, $4, $5)
RETURNING {CLARIFICATION_COLUMNS}"
		);
		let mut created = Vec::with_capacity(questions.len());

		for (idx, question) in questions.into_iter().enumerate() {
			let row: ClarificationRow = sqlx::query_as(&sql)
				.bind(Uuid::new_v4())
				.bind(run_id)
				.bind(offset + idx as i32 + 1)
				.bind(&question.question)
				.bind(Json(&question.options))
				.fetch_one(&mut *tx)
				.await?;

			created.push(row.into());
		}

		tx.commit().await?;

		Ok(created)
	}

	async fn get_clarification_inner(
		&self,
		org_id: &str,
		clarification_id: Uuid,
	) -> Result<Clarification> {
		let row: Option<ClarificationRow> = sqlx::query_as(
			"\
SELECT c.id, c.run_id, c.seq, c.question, c.options, c.answer, c.created_at, c.answered_at
FROM clarifications c
JOIN runs r ON r.id = c.run_id
WHERE c.id = $1 AND r.org_id = $2",
		)
		.bind(clarification_id)
		.bind(org_id)
		.fetch_optional(&self.db.pool)
		.await?;

		row.map(Clarification::from)
			.ok_or_else(|| Error::NotFound("Clarification not found.".to_string()))
	}

	async fn answer_inner(
		&self,
		org_id: &str,
		clarification_id: Uuid,
		answer: &str,
	) -> Result<AnswerOutcome> {
		let not_found = || Error::NotFound("Clarification not found.".to_string());
		let mut tx = self.db.pool.begin().await?;
		let run_id: Option<Uuid> = sqlx::query_scalar(
			"\
SELECT c.run_id
FROM clarifications c
JOIN runs r ON r.id = c.run_id
WHERE c.id = $1 AND r.org_id = $2",
		)
		.bind(clarification_id)
		.bind(org_id)
		.fetch_optional(&mut *tx)
		.await?;
		let run_id = run_id.ok_or_else(not_found)?;
		// Answers for one run are serialized on the run row so exactly one of them sees the last
		// open question.
		let run = org_run(&mut tx, org_id, run_id, " FOR UPDATE").await?;

		if run.status != RunStatus::NeedsClarification {
			return Err(store::status_conflict(&run, &[RunStatus::NeedsClarification]));
		}

		let current: ClarificationRow = sqlx::query_as(&format!(
			"SELECT {CLARIFICATION_COLUMNS} FROM clarifications WHERE id = $1"
		))
		.bind(clarification_id)
		.fetch_one(&mut *tx)
		.await?;
		let clarification: Clarification = match current.answer.as_deref() {
			Some(existing) if existing == answer => current.into(),
			Some(_) => return Err(Error::Conflict("Clarification was already answered.".to_string())),
			None => {
				let row: ClarificationRow = sqlx::query_as(&format!(
					"\
UPDATE clarifications
SET answer = $2, answered_at = now()
WHERE id = $1
RETURNING {CLARIFICATION_COLUMNS}"
				))
				.bind(clarification_id)
				.bind(answer)
				.fetch_one(&mut *tx)
				.await?;

				row.into()
			},
		};
		let remaining: Vec<ClarificationRow> = sqlx::query_as(&format!(
			"\
SELECT {CLARIFICATION_COLUMNS}
FROM clarifications
WHERE run_id = $1 AND answer IS NULL
ORDER BY seq"
		))
		.bind(run_id)
		.fetch_all(&mut *tx)
		.await?;
		let resumed = remaining.is_empty();
		let run = if resumed {
			cas(&mut tx, run_id, &[RunStatus::NeedsClarification], RunStatus::Running, None).await?
		} else {
			run
		};

		tx.commit().await?;

		Ok(AnswerOutcome {
			run,
			clarification,
			remaining: remaining.into_iter().map(Clarification::from).collect(),
			resumed,
		})
	}

	async fn stage_inner(
		&self,
		run_id: Uuid,
		summary: &str,
		actions: Vec<NewAction>,
	) -> Result<Vec<ProposedAction>> {
		let mut tx = self.db.pool.begin().await?;
		let staged: Option<Uuid> = sqlx::query_scalar(
			"\
UPDATE runs
SET status = 'ready_to_commit', summary = $2, updated_at = now()
WHERE id = $1 AND status = 'running'
RETURNING id",
		)
		.bind(run_id)
		.bind(summary)
		.fetch_optional(&mut *tx)
		.await?;

		if staged.is_none() {
			return Err(status_error(&mut tx, run_id, &[RunStatus::Running]).await);
		}

		let sql = format!(
			"\
INSERT INTO proposed_actions (
	id, run_id, seq, action_type, action_group, payload, status, assumptions, confidence_score
)
VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
RETURNING {ACTION_COLUMNS}"
		);
		let mut created = Vec::with_capacity(actions.len());

		for (idx, action) in actions.into_iter().enumerate() {
			let row: ActionRow = sqlx::query_as(&sql)
				.bind(Uuid::new_v4())
				.bind(run_id)
				.bind(idx as i32 + 1)
				.bind(action.action_type.as_str())
				.bind(action.action_group)
				.bind(&action.payload)
				.bind(Json(&action.assumptions))
				.bind(action.confidence_score)
				.fetch_one(&mut *tx)
				.await?;

			created.push(row.try_into()?);
		}

		tx.commit().await?;

		Ok(created)
	}

	async fn update_payload_inner(
		&self,
		org_id: &str,
		run_id: Uuid,
		action_id: Uuid,
		payload: Option<Value>,
	) -> Result<PayloadUpdate> {
		let mut tx = self.db.pool.begin().await?;
		let previous = reviewable_action(&mut tx, org_id, run_id, action_id).await?;
		let row: ActionRow = sqlx::query_as(&format!(
			"\
UPDATE proposed_actions
SET provider_modified_payload = $2, revision = revision + 1, updated_at = now()
WHERE id = $1
RETURNING {ACTION_COLUMNS}"
		))
		.bind(action_id)
		.bind(&payload)
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;

		Ok(PayloadUpdate { action: row.try_into()?, previous: previous.provider_modified_payload })
	}

	async fn record_dispositions_inner(
		&self,
		org_id: &str,
		run_id: Uuid,
		action_id: Uuid,
		dispositions: Vec<Disposition>,
	) -> Result<ProposedAction> {
		let mut tx = self.db.pool.begin().await?;
		let current = reviewable_action(&mut tx, org_id, run_id, action_id).await?;
		let merged = store::merge_dispositions(&current.dispositions, dispositions);
		let row: ActionRow = sqlx::query_as(&format!(
			"\
UPDATE proposed_actions
SET dispositions = $2, revision = revision + 1, updated_at = now()
WHERE id = $1
RETURNING {ACTION_COLUMNS}"
		))
		.bind(action_id)
		.bind(Json(&merged))
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;

		row.try_into()
	}

	async fn commit_inner(&self, plan: &CommitPlan) -> Result<CommitReceipt> {
		let mut tx = self.db.pool.begin().await?;
		let claimed: Option<Uuid> = sqlx::query_scalar(
			"\
UPDATE runs
SET status = 'committing', updated_at = now()
WHERE id = $1 AND org_id = $2 AND status = 'ready_to_commit'
RETURNING id",
		)
		.bind(plan.run_id)
		.bind(&plan.org_id)
		.fetch_optional(&mut *tx)
		.await?;

		if claimed.is_none() {
			org_run(&mut tx, &plan.org_id, plan.run_id, "").await?;

			return Err(status_error(&mut tx, plan.run_id, &[RunStatus::ReadyToCommit]).await);
		}

		for write in &plan.writes {
			let marked = sqlx::query(
				"\
UPDATE proposed_actions
SET status = 'committed', updated_at = now()
WHERE id = $1 AND run_id = $2 AND action_group = $3 AND revision = $4 AND status = 'pending'",
			)
			.bind(write.action_id)
			.bind(plan.run_id)
			.bind(plan.action_group)
			.bind(write.revision)
			.execute(&mut *tx)
			.await?;

			if marked.rows_affected() != 1 {
				return Err(Error::Conflict(
					"Action changed while the commit was prepared.".to_string(),
				));
			}
		}

		let still_pending: i64 = sqlx::query_scalar(
			"\
SELECT count(*)
FROM proposed_actions
WHERE run_id = $1 AND action_group = $2 AND status = 'pending'",
		)
		.bind(plan.run_id)
		.bind(plan.action_group)
		.fetch_one(&mut *tx)
		.await?;

		if still_pending > 0 {
			return Err(Error::Conflict("Commit plan does not cover the whole group.".to_string()));
		}

		let mut records = Vec::with_capacity(plan.writes.len());
		let mut audit = Vec::with_capacity(plan.writes.len());
		let audit_sql = format!(
			"\
INSERT INTO audit_entries (
	id, org_id, run_id, action_id, actor_id, target_table, record_id, operation
)
VALUES ($1, $2, $3, $4, $5, $6, $7, 'insert')
RETURNING {AUDIT_COLUMNS}"
		);

		for write in &plan.writes {
			// Table names come from a closed enum, never from input.
			let created_at: OffsetDateTime = sqlx::query_scalar(&format!(
				"\
INSERT INTO {} (id, org_id, patient_id, encounter_id, run_id, action_id, body, created_by)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING created_at",
				write.table.as_str()
			))
			.bind(write.record_id)
			.bind(&plan.org_id)
			.bind(&write.patient_id)
			.bind(&write.encounter_id)
			.bind(plan.run_id)
			.bind(write.action_id)
			.bind(&write.body)
			.bind(&plan.actor_id)
			.fetch_one(&mut *tx)
			.await?;
			let entry: AuditRow = sqlx::query_as(&audit_sql)
				.bind(Uuid::new_v4())
				.bind(&plan.org_id)
				.bind(plan.run_id)
				.bind(write.action_id)
				.bind(&plan.actor_id)
				.bind(write.table.as_str())
				.bind(write.record_id)
				.fetch_one(&mut *tx)
				.await?;

			records.push(ClinicalRecord {
				table: write.table,
				id: write.record_id,
				org_id: plan.org_id.clone(),
				patient_id: write.patient_id.clone(),
				encounter_id: write.encounter_id.clone(),
				run_id: plan.run_id,
				action_id: write.action_id,
				body: write.body.clone(),
				created_by: plan.actor_id.clone(),
				created_at,
			});
			audit.push(entry.try_into()?);
		}

		let run =
			cas(&mut tx, plan.run_id, &[RunStatus::Committing], RunStatus::Committed, None).await?;

		tx.commit().await?;

		Ok(CommitReceipt { run, records, audit })
	}

	async fn reject_inner(&self, org_id: &str, run_id: Uuid, reason: Option<&str>) -> Result<Run> {
		let expected = [RunStatus::ReadyToCommit, RunStatus::NeedsClarification];
		let mut tx = self.db.pool.begin().await?;
		let row: Option<RunRow> = sqlx::query_as(&format!(
			"\
UPDATE runs
SET status = 'rejected', rejection_reason = $3, updated_at = now()
WHERE id = $1 AND org_id = $2 AND status = ANY($4)
RETURNING {RUN_COLUMNS}"
		))
		.bind(run_id)
		.bind(org_id)
		.bind(reason)
		.bind(status_names(&expected))
		.fetch_optional(&mut *tx)
		.await?;
		let Some(row) = row else {
			org_run(&mut tx, org_id, run_id, "").await?;

			return Err(status_error(&mut tx, run_id, &expected).await);
		};

		sqlx::query(
			"\
UPDATE proposed_actions
SET status = 'rejected', updated_at = now()
WHERE run_id = $1 AND status = 'pending'",
		)
		.bind(run_id)
		.execute(&mut *tx)
		.await?;

		let mut step = NewStep::new(StepKind::Rejection);

		step.text = reason.map(ToString::to_string);
		insert_step(&mut tx, run_id, step).await?;
		tx.commit().await?;

		row.try_into()
	}

	async fn audit_entries_inner(&self, org_id: &str, run_id: Uuid) -> Result<Vec<AuditEntry>> {
		let mut conn = self.db.pool.acquire().await?;

		org_run(&mut conn, org_id, run_id, "").await?;

		let rows: Vec<AuditRow> = sqlx::query_as(&format!(
			"SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE run_id = $1 ORDER BY created_at, id"
		))
		.bind(run_id)
		.fetch_all(&mut *conn)
		.await?;

		rows.into_iter().map(AuditEntry::try_from).collect()
	}

	async fn patient_records_inner(
		&self,
		org_id: &str,
		patient_id: &str,
		limit: usize,
	) -> Result<Vec<ClinicalRecord>> {
		let selects = TargetTable::ALL
			.iter()
			.map(|table| {
				format!(
					"\
SELECT '{table}' AS target_table, id, org_id, patient_id, encounter_id, run_id, action_id, body,
	created_by, created_at
FROM {table}
WHERE org_id = $1 AND patient_id = $2"
				)
			})
			.collect::<Vec<_>>()
			.join("\nUNION ALL\n");
		let sql = format!("{selects}\nORDER BY created_at DESC\nLIMIT $3");
		let rows: Vec<ClinicalRow> = sqlx::query_as(&sql)
			.bind(org_id)
			.bind(patient_id)
			.bind(limit as i64)
			.fetch_all(&self.db.pool)
			.await?;

		rows.into_iter().map(ClinicalRecord::try_from).collect()
	}
}

impl RunStore for PgStore {
	fn create_run<'a>(&'a self, run: NewRun) -> BoxFuture<'a, Result<CreateRunOutcome>> {
		Box::pin(self.create_run_inner(run))
	}

	fn get_run<'a>(&'a self, org_id: &'a str, run_id: Uuid) -> BoxFuture<'a, Result<Run>> {
		Box::pin(self.get_run_inner(org_id, run_id))
	}

	fn run_detail<'a>(&'a self, org_id: &'a str, run_id: Uuid) -> BoxFuture<'a, Result<RunDetail>> {
		Box::pin(self.run_detail_inner(org_id, run_id))
	}

	fn get_clarification<'a>(
		&'a self,
		org_id: &'a str,
		clarification_id: Uuid,
	) -> BoxFuture<'a, Result<Clarification>> {
		Box::pin(self.get_clarification_inner(org_id, clarification_id))
	}

	fn transition<'a>(
		&'a self,
		run_id: Uuid,
		from: &'a [RunStatus],
		to: RunStatus,
		error_message: Option<&'a str>,
	) -> BoxFuture<'a, Result<Run>> {
		Box::pin(self.transition_inner(run_id, from, to, error_message))
	}

	fn append_step<'a>(&'a self, run_id: Uuid, step: NewStep) -> BoxFuture<'a, Result<Step>> {
		Box::pin(self.append_step_inner(run_id, step))
	}

	fn suspend_for_clarification<'a>(
		&'a self,
		run_id: Uuid,
		questions: Vec<NewClarification>,
	) -> BoxFuture<'a, Result<Vec<Clarification>>> {
		Box::pin(self.suspend_inner(run_id, questions))
	}

	fn answer_clarification<'a>(
		&'a self,
		org_id: &'a str,
		clarification_id: Uuid,
		answer: &'a str,
	) -> BoxFuture<'a, Result<AnswerOutcome>> {
		Box::pin(self.answer_inner(org_id, clarification_id, answer))
	}

	fn stage_actions<'a>(
		&'a self,
		run_id: Uuid,
		summary: &'a str,
		actions: Vec<NewAction>,
	) -> BoxFuture<'a, Result<Vec<ProposedAction>>> {
		Box::pin(self.stage_inner(run_id, summary, actions))
	}

	fn update_action_payload<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		action_id: Uuid,
		payload: Option<Value>,
	) -> BoxFuture<'a, Result<PayloadUpdate>> {
		Box::pin(self.update_payload_inner(org_id, run_id, action_id, payload))
	}

	fn record_dispositions<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		action_id: Uuid,
		dispositions: Vec<Disposition>,
	) -> BoxFuture<'a, Result<ProposedAction>> {
		Box::pin(self.record_dispositions_inner(org_id, run_id, action_id, dispositions))
	}

	fn commit_group<'a>(&'a self, plan: &'a CommitPlan) -> BoxFuture<'a, Result<CommitReceipt>> {
		Box::pin(self.commit_inner(plan))
	}

	fn reject_run<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
		reason: Option<&'a str>,
	) -> BoxFuture<'a, Result<Run>> {
		Box::pin(self.reject_inner(org_id, run_id, reason))
	}

	fn audit_entries<'a>(
		&'a self,
		org_id: &'a str,
		run_id: Uuid,
	) -> BoxFuture<'a, Result<Vec<AuditEntry>>> {
		Box::pin(self.audit_entries_inner(org_id, run_id))
	}

	fn patient_records<'a>(
		&'a self,
		org_id: &'a str,
		patient_id: &'a str,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<ClinicalRecord>>> {
		Box::pin(self.patient_records_inner(org_id, patient_id, limit))
	}
}

fn status_names(statuses: &[RunStatus]) -> Vec<String> {
	statuses.iter().map(|status| status.as_str().to_string()).collect()
}

/// `lock` is appended to the query, e.g. `" FOR UPDATE"`.
async fn org_run(conn: &mut PgConnection, org_id: &str, run_id: Uuid, lock: &str) -> Result<Run> {
	let row: Option<RunRow> = sqlx::query_as(&format!(
		"SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 AND org_id = $2{lock}"
	))
	.bind(run_id)
	.bind(org_id)
	.fetch_optional(conn)
	.await?;

	row.ok_or_else(|| Error::NotFound(RUN_NOT_FOUND.to_string()))?.try_into()
}

async fn cas(
	conn: &mut PgConnection,
	run_id: Uuid,
	from: &[RunStatus],
	to: RunStatus,
	error_message: Option<&str>,
) -> Result<Run> {
	let row: Option<RunRow> = sqlx::query_as(&format!(
		"\
UPDATE runs
SET status = $3, error_message = COALESCE($4, error_message), updated_at = now()
WHERE id = $1 AND status = ANY($2)
RETURNING {RUN_COLUMNS}"
	))
	.bind(run_id)
	.bind(status_names(from))
	.bind(to.as_str())
	.bind(error_message)
	.fetch_optional(&mut *conn)
	.await?;

	match row {
		Some(row) => row.try_into(),
		None => Err(status_error(conn, run_id, from).await),
	}
}

/// Explains why a conditional update on `run_id` matched nothing.
async fn status_error(conn: &mut PgConnection, run_id: Uuid, expected: &[RunStatus]) -> Error {
	let row: Result<Option<RunRow>, sqlx::Error> =
		sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
			.bind(run_id)
			.fetch_optional(conn)
			.await;

	match row {
		Ok(Some(row)) => match Run::try_from(row) {
			Ok(run) => store::status_conflict(&run, expected),
			Err(err) => err,
		},
		Ok(None) => Error::NotFound(RUN_NOT_FOUND.to_string()),
		Err(err) => err.into(),
	}
}

/// Locks the run for share and the action for update, then checks both can still be reviewed.
async fn reviewable_action(
	conn: &mut PgConnection,
	org_id: &str,
	run_id: Uuid,
	action_id: Uuid,
) -> Result<ProposedAction> {
	let run = org_run(conn, org_id, run_id, " FOR SHARE").await?;

	if run.status != RunStatus::ReadyToCommit {
		return Err(store::status_conflict(&run, &[RunStatus::ReadyToCommit]));
	}

	let row: Option<ActionRow> = sqlx::query_as(&format!(
		"SELECT {ACTION_COLUMNS} FROM proposed_actions WHERE id = $1 AND run_id = $2 FOR UPDATE"
	))
	.bind(action_id)
	.bind(run_id)
	.fetch_optional(conn)
	.await?;
	let action: ProposedAction =
		row.ok_or_else(|| Error::NotFound("Action not found.".to_string()))?.try_into()?;

	if action.status != scribe_domain::action::ActionStatus::Pending {
		return Err(Error::Conflict(format!(
			"Action is {}; only pending actions can be reviewed.",
			action.status
		)));
	}

	Ok(action)
}

async fn insert_step(conn: &mut PgConnection, run_id: Uuid, step: NewStep) -> Result<Step> {
	let row: StepRow = sqlx::query_as(&format!(
		"\
INSERT INTO run_steps (
	id, run_id, seq, kind, tool_name, call_id, tool_input, tool_output, text, input_tokens,
	output_tokens
)
VALUES (
	$1, $2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM run_steps WHERE run_id = $2), $3, $4, $5, $6,
	$7, $8, $9, $10
)
RETURNING {STEP_COLUMNS}"
	))
	.bind(Uuid::new_v4())
	.bind(run_id)
	.bind(step.kind.as_str())
	.bind(&step.tool_name)
	.bind(&step.call_id)
	.bind(&step.tool_input)
	.bind(&step.tool_output)
	.bind(&step.text)
	.bind(step.input_tokens)
	.bind(step.output_tokens)
	.fetch_one(conn)
	.await?;

	row.try_into()
}
