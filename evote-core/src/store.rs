//! Typed, bounded persistence over the relational schema. Each operation
//! here opens its own short-lived connection or transaction rather than
//! holding state across chunks; sqlx has no identity map to clear, so rows
//! are simply dropped as they go out of scope.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
	postgres::{PgConnection, PgPoolOptions},
	Connection, PgPool, QueryBuilder,
};

use crate::{
	error::Result,
	types::{
		Chunk, ChunkId, CompensatedShare, DecryptionPhase, ElectionId, GuardianId, Job, JobId, JobState,
		OperationKind, PartialDecryptionState, PartialDecryptionStatus, PartialShare,
	},
};

/// Trait seam over every `Store` operation a chunk worker calls, so
/// `worker.rs`'s four `process_*_chunk` functions can be driven in tests
/// against an in-memory double instead of a real Postgres connection. Every
/// other consumer (`tracker.rs`, `evote-api`'s routes) keeps using the
/// concrete `Store` directly.
#[async_trait]
pub trait JobStore: Send + Sync {
	async fn load_ballot_ciphertexts_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<String>>;
	async fn update_chunk_encrypted_tally(&self, chunk_id: ChunkId, ciphertext: &str) -> Result<()>;
	async fn load_chunk_ciphertext(&self, chunk_id: ChunkId) -> Result<Option<String>>;
	async fn update_chunk_result(&self, chunk_id: ChunkId, result_json: &serde_json::Value) -> Result<()>;
	async fn find_chunk_ids_by_election(&self, election_id: ElectionId) -> Result<Vec<ChunkId>>;

	async fn create_job(&self, election_id: ElectionId, operation: OperationKind, total_chunks: i32) -> Result<Job>;
	async fn mark_job_started(&self, job_id: JobId) -> Result<()>;
	async fn increment_job_progress(&self, job_id: JobId, failed: bool) -> Result<(i32, i32, i32)>;
	async fn mark_job_state(&self, job_id: JobId, state: JobState, error_message: Option<&str>) -> Result<()>;

	async fn insert_partial_share(&self, share: &PartialShare) -> Result<()>;
	async fn insert_compensated_share(&self, share: &CompensatedShare) -> Result<()>;
	async fn load_partial_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<PartialShare>>;
	async fn load_compensated_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<CompensatedShare>>;

	async fn increment_partial_decryption_progress(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<(i32, i32)>;
	async fn mark_partial_decryption_status(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		state: PartialDecryptionState,
		phase: DecryptionPhase,
	) -> Result<()>;
	async fn begin_compensation(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		absent: &[GuardianId],
	) -> Result<GuardianId>;
	async fn complete_current_compensation_target(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<(i32, i32, Option<GuardianId>)>;

	async fn mark_guardian_decrypted(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<()>;
	async fn count_decrypted_guardians(&self, election_id: ElectionId) -> Result<i64>;
	async fn election_quorum(&self, election_id: ElectionId) -> Result<i32>;
	async fn guardian_roster(&self, election_id: ElectionId) -> Result<Vec<(GuardianId, bool)>>;
	async fn guardian_public_info(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<GuardianPublicInfo>;
}

#[async_trait]
impl JobStore for Store {
	async fn load_ballot_ciphertexts_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<String>> {
		Store::load_ballot_ciphertexts_for_chunk(self, chunk_id).await
	}
	async fn update_chunk_encrypted_tally(&self, chunk_id: ChunkId, ciphertext: &str) -> Result<()> {
		Store::update_chunk_encrypted_tally(self, chunk_id, ciphertext).await
	}
	async fn load_chunk_ciphertext(&self, chunk_id: ChunkId) -> Result<Option<String>> {
		Store::load_chunk_ciphertext(self, chunk_id).await
	}
	async fn update_chunk_result(&self, chunk_id: ChunkId, result_json: &serde_json::Value) -> Result<()> {
		Store::update_chunk_result(self, chunk_id, result_json).await
	}
	async fn find_chunk_ids_by_election(&self, election_id: ElectionId) -> Result<Vec<ChunkId>> {
		Store::find_chunk_ids_by_election(self, election_id).await
	}
	async fn create_job(&self, election_id: ElectionId, operation: OperationKind, total_chunks: i32) -> Result<Job> {
		Store::create_job(self, election_id, operation, total_chunks).await
	}
	async fn mark_job_started(&self, job_id: JobId) -> Result<()> {
		Store::mark_job_started(self, job_id).await
	}
	async fn increment_job_progress(&self, job_id: JobId, failed: bool) -> Result<(i32, i32, i32)> {
		Store::increment_job_progress(self, job_id, failed).await
	}
	async fn mark_job_state(&self, job_id: JobId, state: JobState, error_message: Option<&str>) -> Result<()> {
		Store::mark_job_state(self, job_id, state, error_message).await
	}
	async fn insert_partial_share(&self, share: &PartialShare) -> Result<()> {
		Store::insert_partial_share(self, share).await
	}
	async fn insert_compensated_share(&self, share: &CompensatedShare) -> Result<()> {
		Store::insert_compensated_share(self, share).await
	}
	async fn load_partial_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<PartialShare>> {
		Store::load_partial_shares_for_chunk(self, chunk_id).await
	}
	async fn load_compensated_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<CompensatedShare>> {
		Store::load_compensated_shares_for_chunk(self, chunk_id).await
	}
	async fn increment_partial_decryption_progress(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<(i32, i32)> {
		Store::increment_partial_decryption_progress(self, election_id, guardian_id).await
	}
	async fn mark_partial_decryption_status(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		state: PartialDecryptionState,
		phase: DecryptionPhase,
	) -> Result<()> {
		Store::mark_partial_decryption_status(self, election_id, guardian_id, state, phase).await
	}
	async fn begin_compensation(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		absent: &[GuardianId],
	) -> Result<GuardianId> {
		Store::begin_compensation(self, election_id, guardian_id, absent).await
	}
	async fn complete_current_compensation_target(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<(i32, i32, Option<GuardianId>)> {
		Store::complete_current_compensation_target(self, election_id, guardian_id).await
	}
	async fn mark_guardian_decrypted(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<()> {
		Store::mark_guardian_decrypted(self, election_id, guardian_id).await
	}
	async fn count_decrypted_guardians(&self, election_id: ElectionId) -> Result<i64> {
		Store::count_decrypted_guardians(self, election_id).await
	}
	async fn election_quorum(&self, election_id: ElectionId) -> Result<i32> {
		Store::election_quorum(self, election_id).await
	}
	async fn guardian_roster(&self, election_id: ElectionId) -> Result<Vec<(GuardianId, bool)>> {
		Store::guardian_roster(self, election_id).await
	}
	async fn guardian_public_info(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<GuardianPublicInfo> {
		Store::guardian_public_info(self, election_id, guardian_id).await
	}
}

/// Runs the embedded migrations against `url`.
pub async fn migrate(url: &str) -> Result<()> {
	let mut conn = PgConnection::connect(url).await?;
	sqlx::migrate!("./migrations").run(&mut conn).await?;
	Ok(())
}

/// A target guardian's non-secret identity, read for COMPENSATED payloads.
pub struct GuardianPublicInfo {
	pub public_key: String,
	pub sequence_number: i32,
}

#[derive(Clone)]
pub struct Store {
	pool: PgPool,
}

impl Store {
	pub async fn connect(url: &str, min_connections: u32, max_connections: u32, idle_timeout: Duration) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.min_connections(min_connections)
			.max_connections(max_connections)
			.idle_timeout(idle_timeout)
			.connect(url)
			.await?;
		Ok(Self { pool })
	}

	pub fn with_pool(pool: PgPool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	// -- ballots -----------------------------------------------------------

	pub async fn count_cast_ballots(&self, election_id: ElectionId) -> Result<i64> {
		let (count,): (i64,) =
			sqlx::query_as("SELECT COUNT(*) FROM ballots WHERE election_id = $1 AND status = 'cast'")
				.bind(election_id.0)
				.fetch_one(&self.pool)
				.await?;
		Ok(count)
	}

	/// Ordered, full id list for the cryptographically-seeded shuffle. Not a
	/// projection-only call by nature (the planner needs every id once, up
	/// front); every subsequent chunk operation below is projection-only.
	pub async fn load_cast_ballot_ids(&self, election_id: ElectionId) -> Result<Vec<uuid::Uuid>> {
		let rows: Vec<(uuid::Uuid,)> =
			sqlx::query_as("SELECT id FROM ballots WHERE election_id = $1 AND status = 'cast' ORDER BY id")
				.bind(election_id.0)
				.fetch_all(&self.pool)
				.await?;
		Ok(rows.into_iter().map(|(id,)| id).collect())
	}

	pub async fn has_existing_chunking(&self, election_id: ElectionId) -> Result<bool> {
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks WHERE election_id = $1")
			.bind(election_id.0)
			.fetch_one(&self.pool)
			.await?;
		Ok(count > 0)
	}

	/// Persists the shuffle seed and chunk size for an election planned in
	/// `AssignmentMode::RederiveFromSeed`, so the same partition can be
	/// recomputed later without a per-ballot `chunk_id` write.
	pub async fn set_planner_metadata(&self, election_id: ElectionId, seed: &[u8; 32], chunk_size: i32) -> Result<()> {
		sqlx::query("UPDATE elections SET shuffle_seed = $1, chunk_size = $2 WHERE id = $3")
			.bind(&seed[..])
			.bind(chunk_size)
			.bind(election_id.0)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn load_planner_metadata(&self, election_id: ElectionId) -> Result<Option<([u8; 32], i32)>> {
		let row: (Option<Vec<u8>>, Option<i32>) =
			sqlx::query_as("SELECT shuffle_seed, chunk_size FROM elections WHERE id = $1")
				.bind(election_id.0)
				.fetch_one(&self.pool)
				.await?;
		match row {
			(Some(seed_bytes), Some(chunk_size)) if seed_bytes.len() == 32 => {
				let mut seed = [0u8; 32];
				seed.copy_from_slice(&seed_bytes);
				Ok(Some((seed, chunk_size)))
			}
			_ => Ok(None),
		}
	}

	// -- chunks --------------------------------------------------------

	/// Inserts one row per chunk in a single batched statement via sqlx's
	/// `QueryBuilder`.
	pub async fn insert_chunks(&self, election_id: ElectionId, ordinals: &[i32]) -> Result<Vec<ChunkId>> {
		let ids: Vec<uuid::Uuid> = (0..ordinals.len()).map(|_| uuid::Uuid::new_v4()).collect();

		let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("INSERT INTO chunks (id, election_id, ordinal) ");
		qb.push_values(ordinals.iter().zip(ids.iter()), |mut b, (ordinal, id)| {
			b.push_bind(*id).push_bind(election_id.0).push_bind(*ordinal);
		});
		qb.build().execute(&self.pool).await?;

		Ok(ids.into_iter().map(ChunkId).collect())
	}

	pub async fn update_chunk_encrypted_tally(&self, chunk_id: ChunkId, ciphertext: &str) -> Result<()> {
		sqlx::query("UPDATE chunks SET encrypted_tally = $1 WHERE id = $2")
			.bind(ciphertext)
			.bind(chunk_id.0)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn update_chunk_result(&self, chunk_id: ChunkId, result_json: &serde_json::Value) -> Result<()> {
		sqlx::query("UPDATE chunks SET result_json = $1 WHERE id = $2")
			.bind(result_json)
			.bind(chunk_id.0)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn find_chunk_ids_by_election(&self, election_id: ElectionId) -> Result<Vec<ChunkId>> {
		let rows: Vec<(uuid::Uuid,)> =
			sqlx::query_as("SELECT id FROM chunks WHERE election_id = $1 ORDER BY ordinal")
				.bind(election_id.0)
				.fetch_all(&self.pool)
				.await?;
		Ok(rows.into_iter().map(|(id,)| ChunkId(id)).collect())
	}

	pub async fn load_chunk(&self, chunk_id: ChunkId) -> Result<Chunk> {
		sqlx::query_as::<_, Chunk>(
			"SELECT id, election_id, ordinal, encrypted_tally, result_json FROM chunks WHERE id = $1",
		)
		.bind(chunk_id.0)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn load_chunk_ciphertext(&self, chunk_id: ChunkId) -> Result<Option<String>> {
		let (ciphertext,): (Option<String>,) = sqlx::query_as("SELECT encrypted_tally FROM chunks WHERE id = $1")
			.bind(chunk_id.0)
			.fetch_one(&self.pool)
			.await?;
		Ok(ciphertext)
	}

	/// Loads the ballot ciphertexts belonging to a chunk. Under
	/// `AssignmentMode::StoreOnBallot` this is a direct projection by
	/// `chunk_id`; under `AssignmentMode::RederiveFromSeed` (detected by the
	/// presence of planner metadata on the chunk's election) the original
	/// shuffle is replayed and re-sliced by the chunk's ordinal instead.
	pub async fn load_ballot_ciphertexts_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<String>> {
		let (election_id, ordinal): (uuid::Uuid, i32) =
			sqlx::query_as("SELECT election_id, ordinal FROM chunks WHERE id = $1")
				.bind(chunk_id.0)
				.fetch_one(&self.pool)
				.await?;
		let election_id = ElectionId(election_id);
		match self.load_planner_metadata(election_id).await? {
			Some((seed, chunk_size)) => {
				let mut ballot_ids = self.load_cast_ballot_ids(election_id).await?;
				crate::planner::fisher_yates_shuffle(&mut ballot_ids, seed);
				let start = ordinal as usize * chunk_size as usize;
				let end = (start + chunk_size as usize).min(ballot_ids.len());
				let slice = ballot_ids.get(start..end).unwrap_or(&[]);
				if slice.is_empty() {
					return Ok(Vec::new());
				}
				let mut qb: QueryBuilder<sqlx::Postgres> =
					QueryBuilder::new("SELECT ciphertext FROM ballots WHERE id IN (");
				let mut separated = qb.separated(", ");
				for id in slice {
					separated.push_bind(*id);
				}
				separated.push_unseparated(") ORDER BY id");
				let rows: Vec<(String,)> = qb.build_query_as().fetch_all(&self.pool).await?;
				Ok(rows.into_iter().map(|(c,)| c).collect())
			}
			None => {
				let rows: Vec<(String,)> =
					sqlx::query_as("SELECT ciphertext FROM ballots WHERE chunk_id = $1 ORDER BY id")
						.bind(chunk_id.0)
						.fetch_all(&self.pool)
						.await?;
				Ok(rows.into_iter().map(|(c,)| c).collect())
			}
		}
	}

	/// `AssignmentMode::StoreOnBallot`: one batched UPDATE tagging every
	/// ballot in `ballot_ids` with `chunk_id`.
	pub async fn assign_ballots_to_chunk(&self, chunk_id: ChunkId, ballot_ids: &[uuid::Uuid]) -> Result<()> {
		if ballot_ids.is_empty() {
			return Ok(());
		}
		let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("UPDATE ballots SET chunk_id = ");
		qb.push_bind(chunk_id.0);
		qb.push(" WHERE id IN (");
		let mut separated = qb.separated(", ");
		for id in ballot_ids {
			separated.push_bind(*id);
		}
		separated.push_unseparated(")");
		qb.build().execute(&self.pool).await?;
		Ok(())
	}

	// -- shares -------------------------------------------------------

	/// Rejects duplicates silently: a unique-constraint violation on
	/// (chunk, guardian) is treated as a successful idempotent no-op.
	pub async fn insert_partial_share(&self, share: &PartialShare) -> Result<()> {
		let res = sqlx::query(
			"INSERT INTO partial_shares (election_id, chunk_id, guardian_id, share) VALUES ($1, $2, $3, $4) \
			 ON CONFLICT (chunk_id, guardian_id) DO NOTHING",
		)
		.bind(share.election_id.0)
		.bind(share.chunk_id.0)
		.bind(share.guardian_id.0)
		.bind(&share.share)
		.execute(&self.pool)
		.await?;
		let _ = res.rows_affected();
		Ok(())
	}

	pub async fn insert_compensated_share(&self, share: &CompensatedShare) -> Result<()> {
		sqlx::query(
			"INSERT INTO compensated_shares (election_id, chunk_id, source_guardian_id, target_guardian_id, share) \
			 VALUES ($1, $2, $3, $4, $5) \
			 ON CONFLICT (chunk_id, source_guardian_id, target_guardian_id) DO NOTHING",
		)
		.bind(share.election_id.0)
		.bind(share.chunk_id.0)
		.bind(share.source_guardian_id.0)
		.bind(share.target_guardian_id.0)
		.bind(&share.share)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn load_partial_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<PartialShare>> {
		sqlx::query_as::<_, PartialShare>(
			"SELECT election_id, chunk_id, guardian_id, share FROM partial_shares WHERE chunk_id = $1",
		)
		.bind(chunk_id.0)
		.fetch_all(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn load_compensated_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<CompensatedShare>> {
		sqlx::query_as::<_, CompensatedShare>(
			"SELECT election_id, chunk_id, source_guardian_id, target_guardian_id, share \
			 FROM compensated_shares WHERE chunk_id = $1",
		)
		.bind(chunk_id.0)
		.fetch_all(&self.pool)
		.await
		.map_err(Into::into)
	}

	// -- jobs -----------------------------------------------------------

	pub async fn find_job_for_election(&self, election_id: ElectionId, operation: OperationKind) -> Result<Option<Job>> {
		sqlx::query_as::<_, Job>(
			"SELECT id, election_id, operation, state, total_chunks, processed_chunks, failed_chunks, \
			 created_at, started_at, completed_at, error_message \
			 FROM jobs WHERE election_id = $1 AND operation = $2 \
			 ORDER BY created_at DESC LIMIT 1",
		)
		.bind(election_id.0)
		.bind(operation)
		.fetch_optional(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn create_job(&self, election_id: ElectionId, operation: OperationKind, total_chunks: i32) -> Result<Job> {
		sqlx::query_as::<_, Job>(
			"INSERT INTO jobs (id, election_id, operation, state, total_chunks, processed_chunks, failed_chunks, created_at) \
			 VALUES ($1, $2, $3, 'PENDING', $4, 0, 0, now()) \
			 RETURNING id, election_id, operation, state, total_chunks, processed_chunks, failed_chunks, \
			 created_at, started_at, completed_at, error_message",
		)
		.bind(uuid::Uuid::new_v4())
		.bind(election_id.0)
		.bind(operation)
		.bind(total_chunks)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn load_job(&self, job_id: JobId) -> Result<Job> {
		sqlx::query_as::<_, Job>(
			"SELECT id, election_id, operation, state, total_chunks, processed_chunks, failed_chunks, \
			 created_at, started_at, completed_at, error_message FROM jobs WHERE id = $1",
		)
		.bind(job_id.0)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn mark_job_started(&self, job_id: JobId) -> Result<()> {
		sqlx::query("UPDATE jobs SET state = 'IN_PROGRESS', started_at = now() WHERE id = $1 AND started_at IS NULL")
			.bind(job_id.0)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Atomic `processed = processed + 1 ... RETURNING` so the worker that
	/// wrote the final row can observe the processed+failed==total crossing
	/// and perform completion-side effects exactly once.
	pub async fn increment_job_progress(&self, job_id: JobId, failed: bool) -> Result<(i32, i32, i32)> {
		let row: (i32, i32, i32) = if failed {
			sqlx::query_as(
				"UPDATE jobs SET failed_chunks = failed_chunks + 1 WHERE id = $1 \
				 RETURNING processed_chunks, failed_chunks, total_chunks",
			)
			.bind(job_id.0)
			.fetch_one(&self.pool)
			.await?
		} else {
			sqlx::query_as(
				"UPDATE jobs SET processed_chunks = processed_chunks + 1 WHERE id = $1 \
				 RETURNING processed_chunks, failed_chunks, total_chunks",
			)
			.bind(job_id.0)
			.fetch_one(&self.pool)
			.await?
		};
		Ok(row)
	}

	pub async fn mark_job_state(&self, job_id: JobId, state: JobState, error_message: Option<&str>) -> Result<()> {
		let completed_at_clause = matches!(state, JobState::Completed | JobState::Failed);
		if completed_at_clause {
			sqlx::query("UPDATE jobs SET state = $1, error_message = $2, completed_at = now() WHERE id = $3")
				.bind(state)
				.bind(error_message)
				.bind(job_id.0)
				.execute(&self.pool)
				.await?;
		} else {
			sqlx::query("UPDATE jobs SET state = $1, error_message = $2 WHERE id = $3")
				.bind(state)
				.bind(error_message)
				.bind(job_id.0)
				.execute(&self.pool)
				.await?;
		}
		Ok(())
	}

	// -- partial decryption status --------------------------------------

	pub async fn find_partial_decryption_status(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<Option<PartialDecryptionStatus>> {
		sqlx::query_as::<_, PartialDecryptionStatus>(
			"SELECT election_id, guardian_id, state, phase, total_chunks, processed_chunks, total_targets, \
			 processed_targets, current_target_guardian_id, current_target_display_name, guardian_contact_email, \
			 created_at, updated_at, error_message FROM partial_decryption_status WHERE election_id = $1 AND guardian_id = $2",
		)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.fetch_optional(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn upsert_partial_decryption_status(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		total_chunks: i32,
	) -> Result<()> {
		sqlx::query(
			"INSERT INTO partial_decryption_status \
			 (election_id, guardian_id, state, phase, total_chunks, processed_chunks, total_targets, processed_targets, \
			  guardian_contact_email, created_at, updated_at) \
			 VALUES ($1, $2, 'PENDING', 'PARTIAL', $3, 0, 0, 0, \
			  (SELECT contact_email FROM guardians WHERE election_id = $1 AND id = $2), now(), now()) \
			 ON CONFLICT (election_id, guardian_id) DO UPDATE SET \
			 state = 'PENDING', phase = 'PARTIAL', total_chunks = EXCLUDED.total_chunks, processed_chunks = 0, \
			 guardian_contact_email = EXCLUDED.guardian_contact_email, error_message = NULL, updated_at = now()",
		)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.bind(total_chunks)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn mark_partial_decryption_status_failed(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		error_message: &str,
	) -> Result<()> {
		sqlx::query(
			"UPDATE partial_decryption_status SET state = 'FAILED', error_message = $1, updated_at = now() \
			 WHERE election_id = $2 AND guardian_id = $3",
		)
		.bind(error_message)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn mark_partial_decryption_status(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		state: PartialDecryptionState,
		phase: DecryptionPhase,
	) -> Result<()> {
		sqlx::query(
			"UPDATE partial_decryption_status SET state = $1, phase = $2, updated_at = now() \
			 WHERE election_id = $3 AND guardian_id = $4",
		)
		.bind(state)
		.bind(phase)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn increment_partial_decryption_progress(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<(i32, i32)> {
		let row: (i32, i32) = sqlx::query_as(
			"UPDATE partial_decryption_status SET processed_chunks = processed_chunks + 1, updated_at = now() \
			 WHERE election_id = $1 AND guardian_id = $2 \
			 RETURNING processed_chunks, total_chunks",
		)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.fetch_one(&self.pool)
		.await?;
		Ok(row)
	}

	/// Starts the COMPENSATED phase for `guardian_id`: targets the first
	/// absent guardian in `absent` and queues the rest. `absent` must be
	/// non-empty; the caller (`worker::process_partial_chunk`) only reaches
	/// this when the roster scan found at least one absent guardian.
	pub async fn begin_compensation(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		absent: &[GuardianId],
	) -> Result<GuardianId> {
		let (first, rest) = absent.split_first().expect("begin_compensation requires a non-empty absent list");
		let remaining: Vec<uuid::Uuid> = rest.iter().map(|g| g.0).collect();
		sqlx::query(
			"UPDATE partial_decryption_status SET phase = 'COMPENSATED', state = 'IN_PROGRESS', \
			 current_target_guardian_id = $1, \
			 current_target_display_name = (SELECT display_name FROM guardians WHERE election_id = $5 AND id = $1), \
			 total_targets = $2, processed_targets = 0, remaining_target_guardian_ids = $3, updated_at = now() \
			 WHERE election_id = $5 AND guardian_id = $4",
		)
		.bind(first.0)
		.bind(absent.len() as i32)
		.bind(&remaining)
		.bind(guardian_id.0)
		.bind(election_id.0)
		.execute(&self.pool)
		.await?;
		Ok(*first)
	}

	/// Called once per COMPENSATED *job* (i.e. once all of that job's chunks
	/// have been processed or permanently failed), not once per chunk — a
	/// single absent guardian's compensation spans every chunk in the
	/// election. Advances to the next absent guardian in
	/// `remaining_target_guardian_ids` if one remains, returning it;
	/// returns `None` once every absent guardian has been compensated.
	pub async fn complete_current_compensation_target(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<(i32, i32, Option<GuardianId>)> {
		let mut tx = self.pool.begin().await?;
		let (processed_targets, total_targets): (i32, i32) = sqlx::query_as(
			"UPDATE partial_decryption_status SET processed_targets = processed_targets + 1, updated_at = now() \
			 WHERE election_id = $1 AND guardian_id = $2 \
			 RETURNING processed_targets, total_targets",
		)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.fetch_one(&mut *tx)
		.await?;

		if processed_targets >= total_targets {
			tx.commit().await?;
			return Ok((processed_targets, total_targets, None));
		}

		let (remaining,): (Vec<uuid::Uuid>,) = sqlx::query_as(
			"SELECT remaining_target_guardian_ids FROM partial_decryption_status \
			 WHERE election_id = $1 AND guardian_id = $2 FOR UPDATE",
		)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.fetch_one(&mut *tx)
		.await?;
		let Some((&next_id, rest)) = remaining.split_first() else {
			tx.commit().await?;
			return Ok((processed_targets, total_targets, None));
		};
		sqlx::query(
			"UPDATE partial_decryption_status SET current_target_guardian_id = $1, \
			 current_target_display_name = (SELECT display_name FROM guardians WHERE election_id = $4 AND id = $1), \
			 remaining_target_guardian_ids = $2, updated_at = now() WHERE election_id = $4 AND guardian_id = $3",
		)
		.bind(next_id)
		.bind(rest)
		.bind(guardian_id.0)
		.bind(election_id.0)
		.execute(&mut *tx)
		.await?;
		tx.commit().await?;
		Ok((processed_targets, total_targets, Some(GuardianId(next_id))))
	}

	/// Sets the boolean the combine-phase quorum check reads, atomically
	/// with marking the guardian's status row completed.
	pub async fn mark_guardian_decrypted(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		sqlx::query("UPDATE guardians SET decrypted_flag = true WHERE election_id = $1 AND id = $2")
			.bind(election_id.0)
			.bind(guardian_id.0)
			.execute(&mut *tx)
			.await?;
		sqlx::query(
			"UPDATE partial_decryption_status SET state = 'COMPLETED', phase = 'COMPLETED', updated_at = now() \
			 WHERE election_id = $1 AND guardian_id = $2",
		)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.execute(&mut *tx)
		.await?;
		tx.commit().await?;
		Ok(())
	}

	pub async fn count_decrypted_guardians(&self, election_id: ElectionId) -> Result<i64> {
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM guardians WHERE election_id = $1 AND decrypted_flag")
			.bind(election_id.0)
			.fetch_one(&self.pool)
			.await?;
		Ok(count)
	}

	pub async fn election_quorum(&self, election_id: ElectionId) -> Result<i32> {
		let (quorum,): (i32,) = sqlx::query_as("SELECT quorum FROM elections WHERE id = $1")
			.bind(election_id.0)
			.fetch_one(&self.pool)
			.await?;
		Ok(quorum)
	}

	pub async fn load_guardian_sealed_share(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<Vec<u8>> {
		let (sealed_share,): (Vec<u8>,) =
			sqlx::query_as("SELECT sealed_share FROM guardians WHERE election_id = $1 AND id = $2")
				.bind(election_id.0)
				.bind(guardian_id.0)
				.fetch_one(&self.pool)
				.await?;
		Ok(sealed_share)
	}

	/// The target guardian's public key and roster sequence order, read by
	/// the COMPENSATED worker when it asks the crypto service to generate a
	/// share on that absent guardian's behalf.
	pub async fn guardian_public_info(&self, election_id: ElectionId, guardian_id: GuardianId) -> Result<GuardianPublicInfo> {
		let (public_key, sequence_number): (String, i32) =
			sqlx::query_as("SELECT public_key, sequence_number FROM guardians WHERE election_id = $1 AND id = $2")
				.bind(election_id.0)
				.bind(guardian_id.0)
				.fetch_one(&self.pool)
				.await?;
		Ok(GuardianPublicInfo { public_key, sequence_number })
	}

	pub async fn guardian_roster(&self, election_id: ElectionId) -> Result<Vec<(GuardianId, bool)>> {
		let rows: Vec<(uuid::Uuid, bool)> = sqlx::query_as(
			"SELECT id, decrypted_flag FROM guardians WHERE election_id = $1 ORDER BY sequence_number",
		)
		.bind(election_id.0)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows.into_iter().map(|(id, flag)| (GuardianId(id), flag)).collect())
	}

	pub async fn all_chunks_combined(&self, election_id: ElectionId) -> Result<bool> {
		let (missing,): (i64,) =
			sqlx::query_as("SELECT COUNT(*) FROM chunks WHERE election_id = $1 AND result_json IS NULL")
				.bind(election_id.0)
				.fetch_one(&self.pool)
				.await?;
		Ok(missing == 0)
	}

	pub async fn load_combined_results(&self, election_id: ElectionId) -> Result<Vec<(i32, serde_json::Value)>> {
		let rows: Vec<(i32, serde_json::Value)> =
			sqlx::query_as("SELECT ordinal, result_json FROM chunks WHERE election_id = $1 ORDER BY ordinal")
				.bind(election_id.0)
				.fetch_all(&self.pool)
				.await?;
		Ok(rows)
	}
}
