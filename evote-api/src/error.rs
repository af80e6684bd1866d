//! Maps `evote_core::Error` onto HTTP status codes and a short JSON error
//! body: short message, no internals leaked.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub struct ApiError(pub evote_core::Error);

impl From<evote_core::Error> for ApiError {
	fn from(e: evote_core::Error) -> Self {
		Self(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> axum::response::Response {
		let (status, code) = match &self.0 {
			evote_core::Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
			evote_core::Error::InvalidCredential => (StatusCode::BAD_REQUEST, "INVALID_CREDENTIAL"),
			evote_core::Error::DuplicateSubmission => (StatusCode::CONFLICT, "DUPLICATE_SUBMISSION"),
			evote_core::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
			evote_core::Error::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
			evote_core::Error::Protocol(_) => (StatusCode::BAD_GATEWAY, "PROTOCOL_ERROR"),
			evote_core::Error::ChunkExhausted => (StatusCode::INTERNAL_SERVER_ERROR, "CHUNK_EXHAUSTED"),
			evote_core::Error::PoolExhausted => (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED"),
			_ => {
				tracing::error!(target: "evote-api", error = %self.0, "unhandled internal error");
				(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
			}
		};
		(status, Json(json!({ "error": { "code": code, "message": self.0.to_string() } }))).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn status_for(err: evote_core::Error) -> StatusCode {
		ApiError::from(err).into_response().status()
	}

	#[test]
	fn invalid_credential_maps_to_bad_request() {
		assert_eq!(status_for(evote_core::Error::InvalidCredential), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn duplicate_submission_maps_to_conflict() {
		assert_eq!(status_for(evote_core::Error::DuplicateSubmission), StatusCode::CONFLICT);
	}

	#[test]
	fn not_found_maps_to_404() {
		assert_eq!(status_for(evote_core::Error::NotFound("job".into())), StatusCode::NOT_FOUND);
	}

	#[test]
	fn pool_exhausted_maps_to_503() {
		assert_eq!(status_for(evote_core::Error::PoolExhausted), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[test]
	fn transport_error_maps_to_bad_gateway() {
		assert_eq!(status_for(evote_core::Error::Transport("timeout".into())), StatusCode::BAD_GATEWAY);
	}
}
