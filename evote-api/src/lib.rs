//! Read-only Admin/Status surface plus the job-submission endpoints, thin
//! `axum` adapters over `evote-core`.

pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::{
	routing::{get, post},
	Router,
};
use evote_core::{store::Store, tracker::ProgressTracker};
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

/// Shared handler state: the store (for read-only projections the tracker
/// doesn't itself expose, e.g. `cached-results` and `healthz`) and the
/// tracker (the single entry point for every submission and status read).
pub struct AppState {
	pub store: Arc<Store>,
	pub tracker: Arc<ProgressTracker>,
}

impl AppState {
	pub fn new(store: Arc<Store>, tracker: Arc<ProgressTracker>) -> Arc<Self> {
		Arc::new(Self { store, tracker })
	}

	pub(crate) fn store_pool(&self) -> &sqlx::PgPool {
		self.store.pool()
	}
}

/// Builds the router over the job-submission and status routes, plus a
/// `/healthz` liveness endpoint.
pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/api/tally/create", post(routes::create_tally))
		.route("/api/guardian/initiate-decryption", post(routes::initiate_decryption))
		.route("/api/guardian/decryption-status/:election_id/:guardian_id", get(routes::decryption_status))
		.route("/api/combine/decryption", post(routes::combine_decryption))
		.route("/api/jobs/:job_id/status", get(routes::job_status))
		.route("/api/election/:id/cached-results", get(routes::cached_results))
		.route("/healthz", get(routes::healthz))
		.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CatchPanicLayer::new()))
		.with_state(state)
}
