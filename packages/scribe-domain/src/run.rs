use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle of a run.
///
/// `pending -> running -> {needs_clarification <-> running} -> ready_to_commit -> committing ->
/// committed`, with `failed` reachable from every non-terminal status and `rejected` reachable
/// from `ready_to_commit` and `needs_clarification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
	Pending,
	Running,
	NeedsClarification,
	ReadyToCommit,
	Committing,
	Committed,
	Failed,
	Rejected,
}
impl RunStatus {
	pub const ALL: [Self; 8] = [
		Self::Pending,
		Self::Running,
		Self::NeedsClarification,
		Self::ReadyToCommit,
		Self::Committing,
		Self::Committed,
		Self::Failed,
		Self::Rejected,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Running => "running",
			Self::NeedsClarification => "needs_clarification",
			Self::ReadyToCommit => "ready_to_commit",
			Self::Committing => "committing",
			Self::Committed => "committed",
			Self::Failed => "failed",
			Self::Rejected => "rejected",
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Committed | Self::Failed | Self::Rejected)
	}

	/// Stable statuses are the ones a client can act on; anything else should be polled.
	pub fn is_stable(self) -> bool {
		matches!(self, Self::NeedsClarification | Self::ReadyToCommit) || self.is_terminal()
	}

	pub fn can_transition_to(self, next: Self) -> bool {
		if next == Self::Failed {
			return !self.is_terminal();
		}

		matches!(
			(self, next),
			(Self::Pending, Self::Running)
				| (Self::Running, Self::NeedsClarification)
				| (Self::NeedsClarification, Self::Running)
				| (Self::Running, Self::ReadyToCommit)
				| (Self::ReadyToCommit, Self::Committing)
				| (Self::Committing, Self::Committed)
				| (Self::ReadyToCommit, Self::Rejected)
				| (Self::NeedsClarification, Self::Rejected)
		)
	}

	/// Statuses from which `next` may be entered.
	pub fn sources_of(next: Self) -> Vec<Self> {
		Self::ALL.into_iter().filter(|status| status.can_transition_to(next)).collect()
	}
}
impl fmt::Display for RunStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for RunStatus {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|status| status.as_str() == raw)
			.ok_or_else(|| Error::UnknownVariant { kind: "run status", value: raw.to_string() })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
	/// The model invoked a tool.
	Tool,
	/// The model answered with plain text and no tool.
	Reasoning,
	/// Answers to clarifications, fed back as a synthetic turn on resume.
	ClarificationAnswers,
	/// The reasoning call failed or returned unusable output.
	Error,
	Rejection,
}
impl StepKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Tool => "tool",
			Self::Reasoning => "reasoning",
			Self::ClarificationAnswers => "clarification_answers",
			Self::Error => "error",
			Self::Rejection => "rejection",
		}
	}

	/// Whether this step consumed one reasoning call from the iteration budget.
	pub fn counts_as_iteration(self) -> bool {
		matches!(self, Self::Tool | Self::Reasoning | Self::Error)
	}
}
impl fmt::Display for StepKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for StepKind {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"tool" => Ok(Self::Tool),
			"reasoning" => Ok(Self::Reasoning),
			"clarification_answers" => Ok(Self::ClarificationAnswers),
			"error" => Ok(Self::Error),
			"rejection" => Ok(Self::Rejection),
			_ => Err(Error::UnknownVariant { kind: "step kind", value: raw.to_string() }),
		}
	}
}
