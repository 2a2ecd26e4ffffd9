//! Rule-based intent classifier.
//!
//! Maps free text plus optional patient and encounter hints to an intent category and coarse
//! entities. The result seeds the agent loop; the reasoning model makes the final call on what to
//! draft.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::Error;

const NEGATION_WINDOW_CHARS: usize = 32;
const GENERAL_CONFIDENCE: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
	ProgressNote,
	TreatmentPlan,
	MedicationChange,
	Scheduling,
	Billing,
	UtilizationReview,
	EncounterDocumentation,
	General,
}
impl IntentType {
	pub const ALL: [Self; 8] = [
		Self::ProgressNote,
		Self::TreatmentPlan,
		Self::MedicationChange,
		Self::Scheduling,
		Self::Billing,
		Self::UtilizationReview,
		Self::EncounterDocumentation,
		Self::General,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::ProgressNote => "progress_note",
			Self::TreatmentPlan => "treatment_plan",
			Self::MedicationChange => "medication_change",
			Self::Scheduling => "scheduling",
			Self::Billing => "billing",
			Self::UtilizationReview => "utilization_review",
			Self::EncounterDocumentation => "encounter_documentation",
			Self::General => "general",
		}
	}
}
impl fmt::Display for IntentType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for IntentType {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|intent| intent.as_str() == raw)
			.ok_or_else(|| Error::UnknownVariant { kind: "intent type", value: raw.to_string() })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
	Patient,
	Encounter,
	Date,
	DurationMinutes,
	CptCode,
	DiagnosisCode,
	Medication,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
	pub kind: EntityKind,
	pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClassifierContext<'a> {
	pub patient_id: Option<&'a str>,
	pub encounter_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
	pub intent: IntentType,
	pub confidence: f32,
	pub entities: Vec<Entity>,
	/// Risk signals found in the request text, e.g. `suicidal_ideation`. Surfaced to the reviewer
	/// even when the model omits them.
	pub risk_signals: Vec<String>,
}

struct Rule {
	intent: IntentType,
	pattern: Regex,
	weight: f32,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
	[
		(IntentType::ProgressNote, r"\bprogress note\b", 3.0),
		(IntentType::ProgressNote, r"\b(session|therapy|soap|dap|birp) note\b", 2.5),
		(IntentType::ProgressNote, r"\b(document|write up|chart)\b.*\bsession\b", 2.0),
		(IntentType::ProgressNote, r"\bnote\b", 1.0),
		(IntentType::TreatmentPlan, r"\btreatment plan\b", 3.0),
		(IntentType::TreatmentPlan, r"\b(goals?|objectives?|interventions?)\b", 1.0),
		(IntentType::MedicationChange, r"\b(start|stop|discontinue|increase|decrease|titrate|taper)\b", 1.5),
		(IntentType::MedicationChange, r"\b(medication|prescri\w*|refill)\b", 2.0),
		(IntentType::MedicationChange, r"\b\d+(\.\d+)?\s*mg\b", 1.5),
		(IntentType::Scheduling, r"\b(schedule|reschedule|book)\b", 2.5),
		(IntentType::Scheduling, r"\b(appointment|follow[- ]?up)\b", 1.5),
		(IntentType::Billing, r"\b(bill|billing|superbill|cpt)\b", 2.5),
		(IntentType::Billing, r"\bcode (the|this) (session|visit)\b", 2.5),
		(IntentType::UtilizationReview, r"\b(utilization review|prior auth\w*|concurrent review)\b", 3.0),
		(IntentType::UtilizationReview, r"\b(level of care|authorization)\b", 1.5),
		(IntentType::EncounterDocumentation, r"\b(new|create|open|log) (an? )?(encounter|visit)\b", 3.0),
	]
	.into_iter()
	.filter_map(|(intent, pattern, weight)| {
		Regex::new(pattern).ok().map(|pattern| Rule { intent, pattern, weight })
	})
	.collect()
});

static RISK_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
	[
		("suicidal_ideation", r"\bsuicid\w*"),
		("self_harm", r"\b(self[- ]?harm\w*|cutting)\b"),
		("homicidal_ideation", r"\bhomicid\w*"),
		("overdose", r"\boverdos\w*"),
	]
	.into_iter()
	.filter_map(|(signal, pattern)| Regex::new(pattern).ok().map(|re| (signal, re)))
	.collect()
});

static NEGATION: LazyLock<Option<Regex>> =
	LazyLock::new(|| Regex::new(r"\b(denies|denied|denying|no|not|without|negative for)\b").ok());

static ENTITY_PATTERNS: LazyLock<Vec<(EntityKind, Regex)>> = LazyLock::new(|| {
	[
		(EntityKind::Date, r"(?i)\b(today|yesterday|tomorrow|this (morning|afternoon|evening)|last (week|session))\b"),
		(EntityKind::Date, r"\b\d{4}-\d{2}-\d{2}\b"),
		(EntityKind::Date, r"\b\d{1,2}/\d{1,2}(/\d{2,4})?\b"),
		(EntityKind::DurationMinutes, r"(?i)\b(\d{1,3})\s*-?\s*(min|mins|minute|minutes)\b"),
		(EntityKind::CptCode, r"\b(9\d{4})\b"),
		(EntityKind::DiagnosisCode, r"\b([A-TV-Z]\d{2}(\.\d{1,4})?)\b"),
		(EntityKind::Medication, r"(?i)\b([a-z]{4,})\s+(\d+(\.\d+)?)\s*mg\b"),
	]
	.into_iter()
	.filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
	.collect()
});

/// NFKC-normalizes and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
	text.nfkc().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn classify(text: &str, ctx: &ClassifierContext<'_>) -> Classification {
	let normalized = normalize_text(text);
	let lowered = normalized.to_lowercase();
	let mut scores: BTreeMap<IntentType, f32> = BTreeMap::new();

	for rule in RULES.iter() {
		if rule.pattern.is_match(&lowered) {
			*scores.entry(rule.intent).or_default() += rule.weight;
		}
	}

	let total: f32 = scores.values().sum();
	// BTreeMap iterates in declaration order, so ties go to the earlier intent.
	let best = scores.iter().fold(None::<(IntentType, f32)>, |best, (intent, score)| match best {
		Some((_, best_score)) if best_score >= *score => best,
		_ => Some((*intent, *score)),
	});
	let (intent, confidence) = match best {
		Some((intent, score)) if total > 0.0 => (intent, (score / total).clamp(0.0, 1.0)),
		_ => (IntentType::General, GENERAL_CONFIDENCE),
	};
	let mut entities = Vec::new();

	if let Some(patient_id) = ctx.patient_id.filter(|id| !id.trim().is_empty()) {
		entities.push(Entity { kind: EntityKind::Patient, value: patient_id.trim().to_string() });
	}
	if let Some(encounter_id) = ctx.encounter_id.filter(|id| !id.trim().is_empty()) {
		entities.push(Entity { kind: EntityKind::Encounter, value: encounter_id.trim().to_string() });
	}

	entities.extend(extract_entities(&normalized));

	Classification { intent, confidence, entities, risk_signals: risk_signals(&lowered) }
}

fn extract_entities(text: &str) -> Vec<Entity> {
	let mut entities: Vec<Entity> = Vec::new();

	for (kind, pattern) in ENTITY_PATTERNS.iter() {
		for captures in pattern.captures_iter(text) {
			let value = match kind {
				EntityKind::DurationMinutes => captures.get(1).map(|m| m.as_str().to_string()),
				EntityKind::Medication => match (captures.get(1), captures.get(2)) {
					(Some(name), Some(dose)) =>
						Some(format!("{} {} mg", name.as_str().to_lowercase(), dose.as_str())),
					_ => None,
				},
				EntityKind::Date => captures.get(0).map(|m| m.as_str().to_lowercase()),
				_ => captures.get(0).map(|m| m.as_str().to_string()),
			};
			let Some(value) = value else {
				continue;
			};
			let entity = Entity { kind: *kind, value };

			if !entities.contains(&entity) {
				entities.push(entity);
			}
		}
	}

	entities
}

fn risk_signals(lowered: &str) -> Vec<String> {
	let mut signals = Vec::new();

	for (signal, pattern) in RISK_PATTERNS.iter() {
		let asserted = pattern.find_iter(lowered).any(|found| !is_negated(lowered, found.start()));

		if asserted {
			signals.push(signal.to_string());
		}
	}

	signals
}

fn is_negated(text: &str, start: usize) -> bool {
	let Some(negation) = NEGATION.as_ref() else {
		return false;
	};
	let window_start = text[..start]
		.char_indices()
		.rev()
		.nth(NEGATION_WINDOW_CHARS - 1)
		.map(|(idx, _)| idx)
		.unwrap_or(0);

	negation.is_match(&text[window_start..start])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn negated_risk_mentions_are_not_signals() {
		assert!(risk_signals("client denies suicidal ideation or intent").is_empty());
		assert_eq!(
			risk_signals("client reported suicidal thoughts this week"),
			vec!["suicidal_ideation".to_string()]
		);
	}

	#[test]
	fn blank_input_is_general() {
		let classification = classify("   ", &ClassifierContext::default());

		assert_eq!(classification.intent, IntentType::General);
		assert!(classification.entities.is_empty());
	}
}
