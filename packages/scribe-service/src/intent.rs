use serde::{Deserialize, Serialize};

use scribe_domain::run::RunStatus;
use scribe_storage::models::NewRun;

use crate::{Error, Result, RunOutcome, ScribeService};

pub const MAX_INPUT_CHARS: usize = 8_000;
const MAX_IDEMPOTENCY_KEY_CHARS: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitIntentRequest {
	pub org_id: String,
	pub user_id: String,
	pub text: String,
	pub patient_id: Option<String>,
	pub encounter_id: Option<String>,
	pub idempotency_key: Option<String>,
}

impl ScribeService {
	/// Creates a run for the request and drives it until it needs a human, or returns the live
	/// run already holding the request's idempotency key.
	pub async fn submit_intent(&self, req: SubmitIntentRequest) -> Result<RunOutcome> {
		let new_run = validate_submit_request(&req)?;
		let intent_type = new_run.intent_type.clone();
		let outcome = self.store.create_run(new_run.clone()).await?;
		let run = outcome.run;

		if !outcome.created {
			if run.input_fingerprint != new_run.input_fingerprint {
				return Err(Error::conflict(
					"Idempotency key was already used for a different request.",
					run.status,
				));
			}

			tracing::info!(run_id = %run.id, org_id = %run.org_id, "Idempotent replay.");

			return self.outcome(&run.org_id, run.id, false).await;
		}

		tracing::info!(
			run_id = %run.id,
			org_id = %run.org_id,
			intent = %intent_type,
			"Run created."
		);

		match self.store.transition(run.id, &[RunStatus::Pending], RunStatus::Running, None).await {
			Ok(claimed) => self.drive(&claimed).await?,
			Err(scribe_storage::Error::Conflict(_)) => {
				tracing::info!(run_id = %run.id, "Claim lost; another caller owns the run.");
			},
			Err(err) => return Err(err.into()),
		}

		self.outcome(&run.org_id, run.id, true).await
	}
}

fn validate_submit_request(req: &SubmitIntentRequest) -> Result<NewRun> {
	let org_id = req.org_id.trim();
	let user_id = req.user_id.trim();
	let text = req.text.trim();

	if org_id.is_empty() || user_id.is_empty() {
		return Err(Error::invalid("org_id and user_id are required."));
	}
	if text.is_empty() {
		return Err(Error::invalid("text must be non-empty."));
	}
	if text.chars().count() > MAX_INPUT_CHARS {
		return Err(Error::invalid(format!("text must be at most {MAX_INPUT_CHARS} characters.")));
	}

	let idempotency_key = non_blank(req.idempotency_key.as_deref());

	if idempotency_key
		.as_ref()
		.map(|key| key.chars().count() > MAX_IDEMPOTENCY_KEY_CHARS)
		.unwrap_or(false)
	{
		return Err(Error::invalid(format!(
			"idempotencyKey must be at most {MAX_IDEMPOTENCY_KEY_CHARS} characters."
		)));
	}

	let patient_id = non_blank(req.patient_id.as_deref());
	let encounter_id = non_blank(req.encounter_id.as_deref());
	let classification = scribe_domain::intent::classify(
		text,
		&scribe_domain::intent::ClassifierContext {
			patient_id: patient_id.as_deref(),
			encounter_id: encounter_id.as_deref(),
		},
	);

	Ok(NewRun {
		org_id: org_id.to_string(),
		user_id: user_id.to_string(),
		patient_id,
		encounter_id,
		idempotency_key,
		input_fingerprint: crate::fingerprint(text),
		input_text: text.to_string(),
		intent_type: classification.intent.as_str().to_string(),
	})
}

fn non_blank(value: Option<&str>) -> Option<String> {
	value.map(str::trim).filter(|value| !value.is_empty()).map(ToString::to_string)
}
