use axum::{
	Json, Router,
	body::Bytes,
	extract::{Path, State},
	http::{HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::{get, patch, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use scribe_domain::{run::RunStatus, safety::Disposition};
use scribe_service::{
	ActionEditResponse, AuditEntryView, CommitRequest, CommitResponse, DispositionsRequest, Error,
	PatchActionRequest, RejectRequest, RejectResponse, RespondRequest, RunDetailView, RunOutcome,
	SubmitIntentRequest, UndoRequest,
};

use crate::state::AppState;

pub const HEADER_ORG_ID: &str = "x-scribe-org-id";
pub const HEADER_USER_ID: &str = "x-scribe-user-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentBody {
	text: String,
	patient_id: Option<String>,
	encounter_id: Option<String>,
	idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RespondBody {
	answer: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchActionBody {
	/// `null` clears the reviewer override.
	provider_modified_payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DispositionsBody {
	dispositions: Vec<Disposition>,
}

#[derive(Debug, Default, Deserialize)]
struct RejectBody {
	#[serde(default)]
	reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error_code: String,
	message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	status: Option<RunStatus>,
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	error_code: String,
	message: String,
	run_status: Option<RunStatus>,
}
impl ApiError {
	fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { status, error_code: error_code.into(), message: message.into(), run_status: None }
	}
}
impl From<Error> for ApiError {
	fn from(err: Error) -> Self {
		match err {
			Error::InvalidRequest { message } =>
				Self::new(StatusCode::BAD_REQUEST, "invalid_request", message),
			Error::Conflict { message, status } => Self {
				run_status: status,
				..Self::new(StatusCode::BAD_REQUEST, "state_conflict", message)
			},
			Error::NotFound { message } => Self::new(StatusCode::NOT_FOUND, "not_found", message),
			Error::Provider { message } => {
				tracing::error!(error = %message, "Reasoning provider failure.");

				Self::new(StatusCode::BAD_GATEWAY, "provider_error", message)
			},
			Error::Storage { message } => {
				tracing::error!(error = %message, "Storage failure.");

				Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", "Internal storage error.")
			},
		}
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body =
			ErrorBody { error_code: self.error_code, message: self.message, status: self.run_status };

		(self.status, Json(body)).into_response()
	}
}

struct Caller {
	org_id: String,
	user_id: Option<String>,
}
impl Caller {
	fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
		let org_id = header(headers, HEADER_ORG_ID)
			.ok_or_else(|| invalid(format!("{HEADER_ORG_ID} header is required.")))?;

		Ok(Self { org_id, user_id: header(headers, HEADER_USER_ID) })
	}

	fn user_id(&self) -> Result<String, ApiError> {
		self.user_id.clone().ok_or_else(|| invalid(format!("{HEADER_USER_ID} header is required.")))
	}
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/intent", post(submit_intent))
		.route("/runs/{run_id}", get(get_run))
		.route("/runs/{run_id}/audit", get(audit_trail))
		.route("/runs/{run_id}/commit", post(commit_run))
		.route("/runs/{run_id}/reject", post(reject_run))
		.route("/runs/{run_id}/actions/{action_id}", patch(patch_action))
		.route("/runs/{run_id}/actions/{action_id}/undo", post(undo_action_edit))
		.route("/runs/{run_id}/actions/{action_id}/dispositions", post(record_dispositions))
		.route("/clarifications/{clarification_id}/respond", post(respond_clarification))
		.with_state(state)
}

async fn health() -> StatusCode {
	StatusCode::OK
}

async fn submit_intent(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: Bytes,
) -> Result<Json<RunOutcome>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let body: IntentBody = parse_body(&body)?;
	let outcome = state
		.service
		.submit_intent(SubmitIntentRequest {
			org_id: caller.org_id.clone(),
			user_id: caller.user_id()?,
			text: body.text,
			patient_id: body.patient_id,
			encounter_id: body.encounter_id,
			idempotency_key: body.idempotency_key,
		})
		.await?;

	Ok(Json(outcome))
}

async fn get_run(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetailView>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let detail = state.service.get_run(&caller.org_id, run_id).await?;

	Ok(Json(detail))
}

async fn audit_trail(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<AuditEntryView>>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let entries = state.service.audit_trail(&caller.org_id, run_id).await?;

	Ok(Json(entries))
}

async fn respond_clarification(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(clarification_id): Path<Uuid>,
	body: Bytes,
) -> Result<Json<RunOutcome>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let body: RespondBody = parse_body(&body)?;
	let outcome = state
		.service
		.respond_clarification(RespondRequest {
			org_id: caller.org_id,
			clarification_id,
			answer: body.answer,
		})
		.await?;

	Ok(Json(outcome))
}

async fn patch_action(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path((run_id, action_id)): Path<(Uuid, Uuid)>,
	body: Bytes,
) -> Result<Json<ActionEditResponse>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let body: PatchActionBody = parse_body(&body)?;
	let response = state
		.service
		.patch_action(PatchActionRequest {
			org_id: caller.org_id,
			run_id,
			action_id,
			provider_modified_payload: body.provider_modified_payload,
		})
		.await?;

	Ok(Json(response))
}

async fn undo_action_edit(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path((run_id, action_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ActionEditResponse>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let response = state
		.service
		.undo_action_edit(UndoRequest { org_id: caller.org_id, run_id, action_id })
		.await?;

	Ok(Json(response))
}

async fn record_dispositions(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path((run_id, action_id)): Path<(Uuid, Uuid)>,
	body: Bytes,
) -> Result<Json<ActionEditResponse>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let body: DispositionsBody = parse_body(&body)?;
	let response = state
		.service
		.record_dispositions(DispositionsRequest {
			org_id: caller.org_id,
			run_id,
			action_id,
			dispositions: body.dispositions,
		})
		.await?;

	Ok(Json(response))
}

async fn commit_run(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(run_id): Path<Uuid>,
) -> Result<Json<CommitResponse>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let response = state
		.service
		.commit_run(CommitRequest { org_id: caller.org_id.clone(), user_id: caller.user_id()?, run_id })
		.await?;

	Ok(Json(response))
}

async fn reject_run(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(run_id): Path<Uuid>,
	body: Bytes,
) -> Result<Json<RejectResponse>, ApiError> {
	let caller = Caller::from_headers(&headers)?;
	let body: RejectBody = if body.is_empty() { RejectBody::default() } else { parse_body(&body)? };
	let response = state
		.service
		.reject_run(RejectRequest { org_id: caller.org_id, run_id, reason: body.reason })
		.await?;

	Ok(Json(response))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
	headers
		.get(name)
		.and_then(|value| value.to_str().ok())
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(ToString::to_string)
}

fn parse_body<T>(body: &[u8]) -> Result<T, ApiError>
where
	T: DeserializeOwned,
{
	serde_json::from_slice(body).map_err(|err| invalid(format!("Invalid request body: {err}.")))
}

fn invalid(message: String) -> ApiError {
	ApiError::new(StatusCode::BAD_REQUEST, "invalid_request", message)
}
