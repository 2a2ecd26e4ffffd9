use scribe_domain::run::RunStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	/// The run is in a status that does not allow the operation. `status` is the run's current
	/// status when it is known, so the caller can resynchronize.
	#[error("Conflict: {message}")]
	Conflict { message: String, status: Option<RunStatus> },
	/// Unknown ids and ids owned by another organization look the same.
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
}
impl Error {
	pub(crate) fn invalid(message: impl Into<String>) -> Self {
		Self::InvalidRequest { message: message.into() }
	}

	pub(crate) fn conflict(message: impl Into<String>, status: RunStatus) -> Self {
		Self::Conflict { message: message.into(), status: Some(status) }
	}
}

impl From<scribe_storage::Error> for Error {
	fn from(err: scribe_storage::Error) -> Self {
		match err {
			scribe_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			scribe_storage::Error::NotFound(message) => Self::NotFound { message },
			scribe_storage::Error::Conflict(message) => Self::Conflict { message, status: None },
			scribe_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			scribe_storage::Error::Serde(inner) => Self::Storage { message: inner.to_string() },
			scribe_storage::Error::Domain(inner) => Self::Storage { message: inner.to_string() },
			scribe_storage::Error::Injected(message) => Self::Storage { message },
		}
	}
}

impl From<scribe_domain::Error> for Error {
	fn from(err: scribe_domain::Error) -> Self {
		Self::InvalidRequest { message: err.to_string() }
	}
}

impl From<scribe_providers::Error> for Error {
	fn from(err: scribe_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}
