use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for the job-orchestration core. Aggregates the
/// lower-level crate errors and adds the domain-specific kinds named
/// in the error-handling design: malformed input, bad credentials,
/// single-flight rejection, transport/protocol failures, chunk
/// exhaustion, pool exhaustion.
#[derive(Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Common(#[from] evote_common::Error),
	#[error(transparent)]
	Queue(#[from] evote_queue::Error),
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),
	#[error("migration error: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),
	#[error("http error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("The credential file you provided is incorrect. Please upload the correct file that was sent to you via email.")]
	InvalidCredential,

	#[error("duplicate submission")]
	DuplicateSubmission,

	#[error("transport error: {0}")]
	Transport(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("chunk exhausted its retry budget")]
	ChunkExhausted,

	#[error("connection pool exhausted")]
	PoolExhausted,

	#[error("not found: {0}")]
	NotFound(String),
}
