#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Domain(#[from] scribe_domain::Error),
	/// Raised by [`crate::memory::MemoryStore`] when a write fault is armed.
	#[error("Injected write failure: {0}")]
	Injected(String),
}
