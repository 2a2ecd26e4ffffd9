pub mod clarification;
pub mod commit;
pub mod intent;
pub mod reject;
pub mod review;
pub mod runs;
pub mod time_serde;
pub mod tools;

mod agent;
mod error;
mod prompt;

pub use clarification::RespondRequest;
pub use commit::{CommitRequest, CommitResponse, CommittedRecord};
pub use error::{Error, Result};
pub use intent::SubmitIntentRequest;
pub use reject::{RejectRequest, RejectResponse};
pub use review::{ActionEditResponse, DispositionsRequest, PatchActionRequest, UndoRequest};
pub use runs::{ActionView, AuditEntryView, ClarificationView, RunDetailView, RunOutcome, RunView, StepView};

use std::{
	collections::HashMap,
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex, MutexGuard},
};

use serde_json::Value;
use uuid::Uuid;

use scribe_config::{Config, LlmProviderConfig};
use scribe_domain::undo::UndoStack;
use scribe_providers::reasoner::{self, ReasonerReply, ToolSpec, Turn};
use scribe_storage::store::RunStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Previous `provider_modified_payload` values of one action, newest last.
pub(crate) type EditHistory = UndoStack<Option<Value>>;

pub trait ReasonerProvider
where
	Self: Send + Sync,
{
	fn reason<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		turns: &'a [Turn],
		tools: &'a [ToolSpec],
	) -> BoxFuture<'a, Result<ReasonerReply>>;
}

#[derive(Clone)]
pub struct Providers {
	pub reasoner: Arc<dyn ReasonerProvider>,
}
impl Providers {
	pub fn new(reasoner: Arc<dyn ReasonerProvider>) -> Self {
		Self { reasoner }
	}
}
impl Default for Providers {
	fn default() -> Self {
		Self { reasoner: Arc::new(DefaultProviders) }
	}
}

pub struct ScribeService {
	pub cfg: Config,
	pub store: Arc<dyn RunStore>,
	pub providers: Providers,
	/// Reviewer edit history per action. Lives only as long as the process and the review.
	edits: Mutex<HashMap<Uuid, EditHistory>>,
}
impl ScribeService {
	pub fn new(cfg: Config, store: Arc<dyn RunStore>) -> Self {
		Self::with_providers(cfg, store, Providers::default())
	}

	pub fn with_providers(cfg: Config, store: Arc<dyn RunStore>, providers: Providers) -> Self {
		Self { cfg, store, providers, edits: Mutex::new(HashMap::new()) }
	}

	pub(crate) fn edits(&self) -> MutexGuard<'_, HashMap<Uuid, EditHistory>> {
		// A poisoned map only loses undo history, never committed state.
		self.edits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Drops the edit history of the given actions once their review is over.
	pub(crate) fn forget_edits(&self, action_ids: impl IntoIterator<Item = Uuid>) {
		let mut edits = self.edits();

		for action_id in action_ids {
			edits.remove(&action_id);
		}
	}

	/// Attaches the run's current status to a storage conflict so the caller can resynchronize.
	pub(crate) async fn conflict_for(
		&self,
		org_id: &str,
		run_id: Uuid,
		err: scribe_storage::Error,
	) -> Error {
		let scribe_storage::Error::Conflict(message) = err else {
			return err.into();
		};

		match self.store.get_run(org_id, run_id).await {
			Ok(run) => Error::conflict(message, run.status),
			Err(_) => Error::Conflict { message, status: None },
		}
	}
}

struct DefaultProviders;
impl ReasonerProvider for DefaultProviders {
	fn reason<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		turns: &'a [Turn],
		tools: &'a [ToolSpec],
	) -> BoxFuture<'a, Result<ReasonerReply>> {
		Box::pin(async move { Ok(reasoner::reason(cfg, turns, tools).await?) })
	}
}

/// blake3 digest of the normalized request text, used to tell idempotent replays from key reuse.
pub(crate) fn fingerprint(text: &str) -> String {
	blake3::hash(scribe_domain::intent::normalize_text(text).as_bytes()).to_hex().to_string()
}
