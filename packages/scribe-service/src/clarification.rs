use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scribe_domain::run::StepKind;
use scribe_storage::models::{Clarification, NewStep, Run};

use crate::{Error, Result, RunOutcome, ScribeService, prompt};

const MAX_ANSWER_CHARS: usize = 4_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RespondRequest {
	pub org_id: String,
	pub clarification_id: Uuid,
	pub answer: String,
}

impl ScribeService {
	/// Records an answer. The run resumes only once every open question of the batch is
	/// answered; until then the outcome lists what is still open.
	pub async fn respond_clarification(&self, req: RespondRequest) -> Result<RunOutcome> {
		let clarification = self.store.get_clarification(&req.org_id, req.clarification_id).await?;
		let answer = resolve_answer(&clarification, &req.answer)?;
		let answered =
			match self.store.answer_clarification(&req.org_id, clarification.id, &answer).await {
				Ok(answered) => answered,
				Err(err) =>
					return Err(self.conflict_for(&req.org_id, clarification.run_id, err).await),
			};
		let run = answered.run;

		tracing::info!(
			run_id = %run.id,
			clarification_id = %clarification.id,
			remaining = answered.remaining.len(),
			"Clarification answered."
		);

		if !answered.resumed {
			return self.outcome(&run.org_id, run.id, false).await;
		}

		// The run is `running` from here on; anything that stops it must fail it.
		if let Err(err) = self.record_answers(&run).await {
			self.fail_run(run.id, &format!("Could not resume after the answers: {err}")).await?;

			return Err(err);
		}

		tracing::info!(run_id = %run.id, "Run resumed.");

		self.drive(&run).await?;

		self.outcome(&run.org_id, run.id, false).await
	}

	/// Appends the turn that hands the latest batch of answers back to the model.
	async fn record_answers(&self, run: &Run) -> Result<()> {
		let detail = self.store.run_detail(&run.org_id, run.id).await?;
		let summary = prompt::answers_summary(&detail.clarifications, &detail.steps);
		let mut step = NewStep::new(StepKind::ClarificationAnswers);

		step.text = Some(summary.text);
		step.tool_output = Some(prompt::answered_through_marker(summary.answered_through));

		self.store.append_step(run.id, step).await?;

		Ok(())
	}
}

/// Trims the answer and, when the question offered options, maps it onto the matching option's
/// spelling.
fn resolve_answer(clarification: &Clarification, answer: &str) -> Result<String> {
	let answer = answer.trim();

	if answer.is_empty() {
		return Err(Error::invalid("answer must be non-empty."));
	}
	if answer.chars().count() > MAX_ANSWER_CHARS {
		return Err(Error::invalid(format!("answer must be at most {MAX_ANSWER_CHARS} characters.")));
	}
	if clarification.options.is_empty() {
		return Ok(answer.to_string());
	}

	clarification
		.options
		.iter()
		.find(|option| option.trim().eq_ignore_ascii_case(answer))
		.cloned()
		.ok_or_else(|| {
			Error::invalid(format!("answer must be one of: {}.", clarification.options.join(", ")))
		})
}
