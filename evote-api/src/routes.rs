use std::sync::Arc;

use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Json},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use evote_core::{tracker::Submission, types::ElectionId, types::GuardianId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{error::ApiError, AppState};

#[derive(Deserialize)]
pub struct TallyCreateRequest {
	pub election_id: uuid::Uuid,
}

#[derive(Serialize)]
struct TallyCreateResponse {
	job_id: uuid::Uuid,
	total_chunks: i32,
	poll_url: String,
}

pub async fn create_tally(
	State(state): State<Arc<AppState>>,
	Json(body): Json<TallyCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let election_id = ElectionId(body.election_id);
	let submission = state.tracker.submit_tally(election_id).await?;
	let (job_id, total_chunks) = match submission {
		Submission::Accepted(job_id) => {
			let job = state.store.load_job(job_id).await?;
			(job_id, job.total_chunks)
		}
		Submission::AlreadyInProgress(job) | Submission::AlreadyCompleted(job) => (job.id, job.total_chunks),
	};
	let body = TallyCreateResponse {
		job_id: job_id.0,
		total_chunks,
		poll_url: format!("/api/jobs/{}/status", job_id.0),
	};
	Ok((StatusCode::ACCEPTED, Json(body)))
}

#[derive(Deserialize)]
pub struct InitiateDecryptionRequest {
	pub election_id: uuid::Uuid,
	pub guardian_id: uuid::Uuid,
	/// Base64-encoded credential file the guardian uploaded; the encrypted
	/// ballot front end that produces this blob is out of scope here.
	pub credential_blob: String,
}

#[derive(Serialize)]
struct InitiateDecryptionResponse {
	job_id: uuid::Uuid,
}

pub async fn initiate_decryption(
	State(state): State<Arc<AppState>>,
	Json(body): Json<InitiateDecryptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let election_id = ElectionId(body.election_id);
	let guardian_id = GuardianId(body.guardian_id);
	let credential_blob = base64_decode(&body.credential_blob).map_err(|_| {
		ApiError(evote_core::Error::InvalidInput("credentialBlob is not valid base64".into()))
	})?;
	let sealed = state.store.load_guardian_sealed_share(election_id, guardian_id).await?;
	let sealed_share = evote_core::SealedShare { envelope: sealed };

	let submission =
		state.tracker.initiate_decryption(election_id, guardian_id, &credential_blob, &sealed_share).await?;
	let job_id = match submission {
		Submission::Accepted(job_id) => job_id,
		Submission::AlreadyInProgress(job) | Submission::AlreadyCompleted(job) => job.id,
	};
	Ok((StatusCode::ACCEPTED, Json(InitiateDecryptionResponse { job_id: job_id.0 })))
}

pub async fn decryption_status(
	State(state): State<Arc<AppState>>,
	Path((election_id, guardian_id)): Path<(uuid::Uuid, uuid::Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
	let status = state
		.tracker
		.decryption_status(ElectionId(election_id), GuardianId(guardian_id))
		.await?
		.ok_or_else(|| ApiError(evote_core::Error::NotFound("no decryption submission for this guardian".into())))?;
	Ok(Json(status))
}

#[derive(Deserialize)]
pub struct CombineRequest {
	pub election_id: uuid::Uuid,
}

#[derive(Serialize)]
struct CombineResponse {
	job_id: uuid::Uuid,
}

pub async fn combine_decryption(
	State(state): State<Arc<AppState>>,
	Json(body): Json<CombineRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let submission = state.tracker.submit_combine(ElectionId(body.election_id)).await?;
	let job_id = match submission {
		Submission::Accepted(job_id) => job_id,
		Submission::AlreadyInProgress(job) | Submission::AlreadyCompleted(job) => job.id,
	};
	Ok((StatusCode::ACCEPTED, Json(CombineResponse { job_id: job_id.0 })))
}

pub async fn job_status(
	State(state): State<Arc<AppState>>,
	Path(job_id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, ApiError> {
	let job = state.tracker.job_status(evote_core::types::JobId(job_id)).await?;
	Ok(Json(job))
}

pub async fn cached_results(
	State(state): State<Arc<AppState>>,
	Path(election_id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, ApiError> {
	let election_id = ElectionId(election_id);
	if !state.store.all_chunks_combined(election_id).await? {
		return Err(ApiError(evote_core::Error::NotFound("Results not yet available".into())));
	}
	let results = state.store.load_combined_results(election_id).await?;
	let results: Vec<_> = results.into_iter().map(|(ordinal, result)| json!({ "ordinal": ordinal, "result": result })).collect();
	Ok(Json(json!({ "electionId": election_id.0, "results": results })))
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
	match sqlx::query("SELECT 1").execute(state.store_pool()).await {
		Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
		Err(e) => {
			tracing::warn!(target: "evote-api", error = %e, "healthz database check failed");
			(StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "degraded" })))
		}
	}
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
	BASE64.decode(input)
}
