//! The bounded tool-calling loop.
//!
//! The loop owns a run only while it is `running`. Every reasoning call is recorded as a step
//! before the next call is made, so the conversation can be rebuilt from the ledger when a
//! suspended run resumes.

use std::time::Duration;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use scribe_domain::{
	action::ActionPayload,
	intent::{self, Classification, ClassifierContext},
	run::{RunStatus, StepKind},
	safety::{self, GateItem},
};
use scribe_providers::reasoner::{ReasonerReply, ToolCall, ToolSpec, Turn, Usage};
use scribe_storage::models::{NewAction, NewStep, Run};

use crate::{
	Error, Result, ScribeService, prompt,
	tools::{self, Draft, Invocation, Tool},
};

const CONTEXT_RECORD_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
	Suspended,
	Staged,
}

impl ScribeService {
	/// Drives a run the caller has already claimed (`running`) until it suspends, stages its
	/// actions, or fails. Collaborator failures are recorded into the run, not returned.
	pub(crate) async fn drive(&self, run: &Run) -> Result<()> {
		match self.run_loop(run).await {
			Ok(halt) => {
				tracing::info!(run_id = %run.id, halt = ?halt, "Agent loop halted.");

				Ok(())
			},
			Err(Error::Conflict { message, .. }) => {
				tracing::warn!(run_id = %run.id, reason = %message, "Run left running state mid-loop.");

				Ok(())
			},
			Err(Error::NotFound { message }) => Err(Error::NotFound { message }),
			Err(err) => self.fail_run(run.id, &err.to_string()).await,
		}
	}

	pub(crate) async fn fail_run(&self, run_id: Uuid, message: &str) -> Result<()> {
		tracing::warn!(run_id = %run_id, error = %message, "Run failed.");

		match self
			.store
			.transition(run_id, &[RunStatus::Running], RunStatus::Failed, Some(message))
			.await
		{
			Ok(_) => Ok(()),
			Err(scribe_storage::Error::Conflict(_)) => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	async fn run_loop(&self, run: &Run) -> Result<Halt> {
		let detail = self.store.run_detail(&run.org_id, run.id).await?;
		let classification = classify_run(run);
		let catalog = tools::catalog();
		let max_iterations = self.cfg.agent.max_iterations as usize;
		let max_clarifications = self.cfg.agent.max_clarifications as usize;
		let mut turns = prompt::opening_turns(&self.cfg, run, &classification);
		let mut drafts = tools::drafts_from_steps(&detail.steps);
		let mut iterations =
			detail.steps.iter().filter(|step| step.kind.counts_as_iteration()).count();

		turns.extend(prompt::replay(&detail.steps));

		loop {
			if iterations >= max_iterations {
				return Err(Error::Provider {
					message: format!(
						"Step limit exceeded: {max_iterations} reasoning calls without submit_results."
					),
				});
			}

			iterations += 1;

			let reply = match self.call_reasoner(&turns, &catalog).await {
				Ok(reply) => reply,
				Err(err) => {
					self.record_error(run.id, None, Usage::default(), &err).await?;

					return Err(err);
				},
			};
			let ReasonerReply { tool_call, text, usage } = reply;
			let Some(call) = tool_call else {
				let mut step = step_with_usage(StepKind::Reasoning, usage);

				step.text = text.clone();
				self.store.append_step(run.id, step).await?;

				tracing::info!(run_id = %run.id, iteration = iterations, tool = "none", "Agent iteration.");

				if let Some(text) = text {
					turns.push(Turn::Assistant { content: text });
				}

				turns.push(prompt::continue_turn());

				continue;
			};

			tracing::info!(run_id = %run.id, iteration = iterations, tool = %call.name, "Agent iteration.");

			let parsed = Tool::from_name(&call.name)
				.ok_or_else(|| Error::Provider {
					message: format!("Reasoner called unknown tool {}.", call.name),
				})
				.and_then(|tool| tools::parse(tool, &call.arguments, max_clarifications));
			let invocation = match parsed {
				Ok(invocation) => invocation,
				Err(err) => {
					self.record_error(run.id, Some(&call), usage, &err).await?;

					return Err(err);
				},
			};

			match invocation {
				Invocation::PatientContext => {
					let output = self.patient_context(run, &classification).await?;

					self.record_tool(run.id, &call, output, usage, &mut turns).await?;
				},
				Invocation::Draft(draft) => {
					let draft_id = tools::next_draft_id(drafts.len());
					let output = serde_json::json!({
						"draft_id": draft_id,
						"action_type": draft.payload.action_type(),
						"gate_items": safety::gate_items(&draft.payload)
							.iter()
							.map(|item| item.key())
							.collect::<Vec<_>>(),
					});

					self.record_tool(run.id, &call, output, usage, &mut turns).await?;
					drafts.push((draft_id, draft));
				},
				Invocation::AskClarification(questions) => {
					let output = serde_json::json!({
						"status": "awaiting_answers",
						"questions": questions.len(),
					});

					self.record_tool(run.id, &call, output, usage, &mut turns).await?;

					let created = self.store.suspend_for_clarification(run.id, questions).await?;

					tracing::info!(run_id = %run.id, clarifications = created.len(), "Run suspended.");

					return Ok(Halt::Suspended);
				},
				Invocation::Submit { summary, groups } => {
					let grouped = match tools::group_drafts(std::mem::take(&mut drafts), &groups) {
						Ok(grouped) => grouped,
						Err(err) => {
							self.record_error(run.id, Some(&call), usage, &err).await?;

							return Err(err);
						},
					};
					let group_count = grouped.len();
					let actions = stage_groups(grouped, &classification.risk_signals);
					let output = serde_json::json!({
						"staged": actions.len(),
						"groups": group_count,
					});

					self.record_tool(run.id, &call, output, usage, &mut turns).await?;

					let staged = self.store.stage_actions(run.id, &summary, actions).await?;

					tracing::info!(
						run_id = %run.id,
						actions = staged.len(),
						groups = group_count,
						"Run staged for review."
					);

					return Ok(Halt::Staged);
				},
			}
		}
	}

	async fn call_reasoner(&self, turns: &[Turn], catalog: &[ToolSpec]) -> Result<ReasonerReply> {
		let timeout_ms = self.cfg.agent.call_timeout_ms;
		let call = self.providers.reasoner.reason(&self.cfg.providers.reasoner, turns, catalog);

		match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
			Ok(result) => result,
			Err(_) => Err(Error::Provider {
				message: format!("Reasoning call timed out after {timeout_ms} ms."),
			}),
		}
	}

	async fn record_tool(
		&self,
		run_id: Uuid,
		call: &ToolCall,
		output: Value,
		usage: Usage,
		turns: &mut Vec<Turn>,
	) -> Result<()> {
		let mut step = step_with_usage(StepKind::Tool, usage);

		step.tool_name = Some(call.name.clone());
		step.call_id = Some(call.call_id.clone());
		step.tool_input = Some(call.arguments.clone());
		step.tool_output = Some(output.clone());

		self.store.append_step(run_id, step).await?;

		turns.push(Turn::ToolCall {
			call_id: call.call_id.clone(),
			name: call.name.clone(),
			arguments: call.arguments.clone(),
		});
		turns.push(Turn::ToolResult { call_id: call.call_id.clone(), content: output });

		Ok(())
	}

	async fn record_error(
		&self,
		run_id: Uuid,
		call: Option<&ToolCall>,
		usage: Usage,
		err: &Error,
	) -> Result<()> {
		let mut step = step_with_usage(StepKind::Error, usage);

		step.text = Some(err.to_string());

		if let Some(call) = call {
			step.tool_name = Some(call.name.clone());
			step.call_id = Some(call.call_id.clone());
			step.tool_input = Some(call.arguments.clone());
		}

		self.store.append_step(run_id, step).await?;

		Ok(())
	}

	async fn patient_context(&self, run: &Run, classification: &Classification) -> Result<Value> {
		let records = match run.patient_id.as_deref() {
			Some(patient_id) =>
				self.store.patient_records(&run.org_id, patient_id, CONTEXT_RECORD_LIMIT).await?,
			None => Vec::new(),
		};
		let records: Vec<Value> = records
			.iter()
			.map(|record| {
				serde_json::json!({
					"table": record.table,
					"record_id": record.id,
					"encounter_id": record.encounter_id,
					"created_at": record.created_at.format(&Rfc3339).ok(),
					"body": record.body,
				})
			})
			.collect();

		Ok(serde_json::json!({
			"patient_id": run.patient_id,
			"encounter_id": run.encounter_id,
			"intent": classification.intent,
			"records": records,
		}))
	}
}

pub(crate) fn classify_run(run: &Run) -> Classification {
	let ctx = ClassifierContext {
		patient_id: run.patient_id.as_deref(),
		encounter_id: run.encounter_id.as_deref(),
	};

	intent::classify(&run.input_text, &ctx)
}

/// Turns grouped drafts into staged actions. Each group gets its own id and is ordered by write
/// rank. Risk signals found in the request are added to every note draft that lacks them.
fn stage_groups(groups: Vec<Vec<Draft>>, risk_signals: &[String]) -> Vec<NewAction> {
	let mut actions = Vec::new();

	for mut group in groups {
		let action_group = Uuid::new_v4();

		group.sort_by_key(|draft| draft.payload.action_type().write_rank());

		for draft in group {
			let Draft { mut payload, mut assumptions, confidence } = draft;

			if let ActionPayload::NoteDraft(note) = &mut payload {
				for signal in risk_signals {
					let signal_key = GateItem::RiskFlag { flag: signal.clone() }.key();

					if !note
						.risk_flags
						.iter()
						.any(|flag| GateItem::RiskFlag { flag: flag.clone() }.key() == signal_key)
					{
						note.risk_flags.push(signal.clone());
						assumptions.push(format!("Risk flag {signal} was raised from the request text."));
					}
				}
			}

			actions.push(NewAction {
				action_type: payload.action_type(),
				action_group,
				payload: payload.to_value(),
				assumptions,
				confidence_score: confidence,
			});
		}
	}

	actions
}

fn step_with_usage(kind: StepKind, usage: Usage) -> NewStep {
	let mut step = NewStep::new(kind);

	step.input_tokens = i64::try_from(usage.input_tokens).unwrap_or(i64::MAX);
	step.output_tokens = i64::try_from(usage.output_tokens).unwrap_or(i64::MAX);

	step
}
