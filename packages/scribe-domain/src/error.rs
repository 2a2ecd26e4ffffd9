pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Unknown {kind}: {value}.")]
	UnknownVariant { kind: &'static str, value: String },
	#[error("Invalid {action_type} payload: {message}")]
	InvalidPayload { action_type: &'static str, message: String },
	#[error("Invalid disposition for {item}: {message}")]
	InvalidDisposition { item: String, message: String },
}
