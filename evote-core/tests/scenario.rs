//! Scenario tests against a real Postgres database (set `TEST_DATABASE_URL`
//! to run). Since these mutate shared tables outside a transaction, every
//! test takes a process-wide mutex before running and truncates on drop,
//! so `cargo test` threads don't stomp each other's rows.

use std::{
	env,
	sync::{Mutex, MutexGuard},
};

use evote_core::{
	planner::{AssignmentMode, Planner, PlannerError},
	store::Store,
	types::{CompensatedShare, ElectionId, GuardianId, JobState, OperationKind, PartialShare},
};
use once_cell::sync::Lazy;
use sqlx::Executor;

static TEST_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static TEST_DATABASE_URL: Lazy<String> =
	Lazy::new(|| env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set to run evote-core scenario tests"));

struct TestGuard<'a> {
	store: Store,
	_lock: MutexGuard<'a, ()>,
}

impl<'a> TestGuard<'a> {
	async fn acquire() -> Self {
		let lock = TEST_MUTEX.lock().expect("test mutex poisoned");
		evote_core::store::migrate(&TEST_DATABASE_URL).await.expect("migrations failed");
		let store = Store::connect(&TEST_DATABASE_URL, 1, 4, std::time::Duration::from_secs(30))
			.await
			.expect("failed to connect to test database");
		Self { store, _lock: lock }
	}
}

impl<'a> Drop for TestGuard<'a> {
	fn drop(&mut self) {
		let pool = self.store.pool().clone();
		tokio::task::block_in_place(|| {
			tokio::runtime::Handle::current().block_on(async move {
				pool.execute(
					"TRUNCATE TABLE partial_decryption_status, compensated_shares, partial_shares, \
					 jobs, chunks, ballots, guardians, elections CASCADE",
				)
				.await
				.expect("truncate failed");
			});
		});
	}
}

async fn seed_election(store: &Store, quorum: i32, ballots: usize) -> ElectionId {
	let election_id = ElectionId(uuid::Uuid::new_v4());
	sqlx::query("INSERT INTO elections (id, quorum) VALUES ($1, $2)")
		.bind(election_id.0)
		.bind(quorum)
		.execute(store.pool())
		.await
		.expect("insert election");

	for _ in 0..ballots {
		sqlx::query("INSERT INTO ballots (id, election_id, status, ciphertext) VALUES ($1, $2, 'cast', 'ct')")
			.bind(uuid::Uuid::new_v4())
			.bind(election_id.0)
			.execute(store.pool())
			.await
			.expect("insert ballot");
	}
	election_id
}

async fn seed_guardian(store: &Store, election_id: ElectionId, sequence_number: i32) -> GuardianId {
	let guardian_id = GuardianId(uuid::Uuid::new_v4());
	sqlx::query(
		"INSERT INTO guardians (id, election_id, sequence_number, sealed_share) VALUES ($1, $2, $3, $4)",
	)
	.bind(guardian_id.0)
	.bind(election_id.0)
	.bind(sequence_number)
	.bind(b"sealed".to_vec())
	.execute(store.pool())
	.await
	.expect("insert guardian");
	guardian_id
}

async fn seed_guardian_named(store: &Store, election_id: ElectionId, sequence_number: i32, display_name: &str) -> GuardianId {
	let guardian_id = seed_guardian(store, election_id, sequence_number).await;
	sqlx::query("UPDATE guardians SET display_name = $1 WHERE election_id = $2 AND id = $3")
		.bind(display_name)
		.bind(election_id.0)
		.bind(guardian_id.0)
		.execute(store.pool())
		.await
		.expect("set guardian display name");
	guardian_id
}

#[tokio::test]
async fn rederive_from_seed_recovers_the_same_partition_as_store_on_ballot() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 5003).await;

	let planner = Planner::new(5000, AssignmentMode::RederiveFromSeed);
	let chunk_ids = planner.plan_tally_chunks(&guard.store, election_id).await.expect("planning failed");
	assert_eq!(chunk_ids.len(), 2);

	let mut total = 0i64;
	for chunk_id in &chunk_ids {
		let ciphertexts = guard.store.load_ballot_ciphertexts_for_chunk(*chunk_id).await.unwrap();
		total += ciphertexts.len() as i64;
	}
	assert_eq!(total, 5003, "every ballot must be recoverable by replaying the stored shuffle seed");

	// Calling it again must be stable: the same chunk always rederives the
	// same ciphertext set rather than a freshly reshuffled one.
	let first_chunk_again = guard.store.load_ballot_ciphertexts_for_chunk(chunk_ids[0]).await.unwrap();
	let first_chunk_first_call = guard.store.load_ballot_ciphertexts_for_chunk(chunk_ids[0]).await.unwrap();
	assert_eq!(first_chunk_again, first_chunk_first_call);
}

#[tokio::test]
async fn guardian_public_info_reads_back_public_key_and_sequence() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 2, 1).await;
	let guardian_id = seed_guardian(&guard.store, election_id, 4).await;

	sqlx::query("UPDATE guardians SET public_key = $1 WHERE election_id = $2 AND id = $3")
		.bind("pubkey-bytes-as-text")
		.bind(election_id.0)
		.bind(guardian_id.0)
		.execute(guard.store.pool())
		.await
		.unwrap();

	let info = guard.store.guardian_public_info(election_id, guardian_id).await.unwrap();
	assert_eq!(info.public_key, "pubkey-bytes-as-text");
	assert_eq!(info.sequence_number, 4);
}

#[tokio::test]
async fn planner_partitions_every_ballot_into_a_chunk() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 5003).await;

	let planner = Planner::new(5000, AssignmentMode::StoreOnBallot);
	let chunk_ids = planner.plan_tally_chunks(&guard.store, election_id).await.expect("planning failed");
	assert_eq!(chunk_ids.len(), 2, "5003 ballots at chunk size 5000 makes two chunks");

	let mut total_assigned = 0i64;
	for chunk_id in &chunk_ids {
		let ciphertexts = guard.store.load_ballot_ciphertexts_for_chunk(*chunk_id).await.unwrap();
		total_assigned += ciphertexts.len() as i64;
	}
	assert_eq!(total_assigned, 5003);
}

#[tokio::test]
async fn planner_rejects_a_second_chunking_of_the_same_election() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 10).await;

	let planner = Planner::new(5000, AssignmentMode::StoreOnBallot);
	planner.plan_tally_chunks(&guard.store, election_id).await.expect("first planning failed");

	let err = planner.plan_tally_chunks(&guard.store, election_id).await.unwrap_err();
	assert!(matches!(err, PlannerError::AlreadyChunked));
}

#[tokio::test]
async fn planner_rejects_an_election_with_no_cast_ballots() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 0).await;

	let planner = Planner::new(5000, AssignmentMode::StoreOnBallot);
	let err = planner.plan_tally_chunks(&guard.store, election_id).await.unwrap_err();
	assert!(matches!(err, PlannerError::EmptyBallotSet));
}

#[tokio::test]
async fn job_progress_crosses_into_terminal_state_on_the_last_increment() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 1).await;
	let job = guard.store.create_job(election_id, OperationKind::Tally, 3).await.unwrap();

	let (processed, failed, total) = guard.store.increment_job_progress(job.id, false).await.unwrap();
	assert_eq!((processed, failed, total), (1, 0, 3));
	let (processed, failed, total) = guard.store.increment_job_progress(job.id, true).await.unwrap();
	assert_eq!((processed, failed, total), (1, 1, 3));
	let (processed, failed, total) = guard.store.increment_job_progress(job.id, false).await.unwrap();
	assert_eq!(processed + failed, total, "the third increment must cross processed+failed==total exactly once");

	guard.store.mark_job_state(job.id, JobState::Completed, None).await.unwrap();
	let reloaded = guard.store.load_job(job.id).await.unwrap();
	assert_eq!(reloaded.state, JobState::Completed);
	assert!(reloaded.completed_at.is_some());
}

#[tokio::test]
async fn duplicate_partial_share_submission_is_an_idempotent_no_op() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 5000).await;
	let planner = Planner::new(5000, AssignmentMode::StoreOnBallot);
	let chunk_ids = planner.plan_tally_chunks(&guard.store, election_id).await.unwrap();
	let chunk_id = chunk_ids[0];
	let guardian_id = seed_guardian(&guard.store, election_id, 0).await;

	let share =
		PartialShare { election_id, chunk_id, guardian_id, share: "abc123".to_string() };
	guard.store.insert_partial_share(&share).await.unwrap();
	guard.store.insert_partial_share(&share).await.unwrap();

	let shares = guard.store.load_partial_shares_for_chunk(chunk_id).await.unwrap();
	assert_eq!(shares.len(), 1, "ON CONFLICT DO NOTHING must keep exactly one row per (chunk, guardian)");
}

#[tokio::test]
async fn compensated_share_is_keyed_by_source_and_target_guardian() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 3, 5000).await;
	let planner = Planner::new(5000, AssignmentMode::StoreOnBallot);
	let chunk_ids = planner.plan_tally_chunks(&guard.store, election_id).await.unwrap();
	let chunk_id = chunk_ids[0];
	let source = seed_guardian(&guard.store, election_id, 0).await;
	let target = seed_guardian(&guard.store, election_id, 1).await;

	let share = CompensatedShare {
		election_id,
		chunk_id,
		source_guardian_id: source,
		target_guardian_id: target,
		share: "xyz789".to_string(),
	};
	guard.store.insert_compensated_share(&share).await.unwrap();

	let shares = guard.store.load_compensated_shares_for_chunk(chunk_id).await.unwrap();
	assert_eq!(shares.len(), 1);
	assert_eq!(shares[0].source_guardian_id, source);
	assert_eq!(shares[0].target_guardian_id, target);
}

#[tokio::test]
async fn guardian_quorum_count_only_reflects_decrypted_guardians() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 2, 1).await;
	let a = seed_guardian(&guard.store, election_id, 0).await;
	let _b = seed_guardian(&guard.store, election_id, 1).await;
	let _c = seed_guardian(&guard.store, election_id, 2).await;

	assert_eq!(guard.store.count_decrypted_guardians(election_id).await.unwrap(), 0);
	guard.store.mark_guardian_decrypted(election_id, a).await.unwrap();
	assert_eq!(guard.store.count_decrypted_guardians(election_id).await.unwrap(), 1);

	let quorum = guard.store.election_quorum(election_id).await.unwrap();
	assert_eq!(quorum, 2);
	assert!(1 < quorum, "a single decrypted guardian must not yet satisfy a quorum of two");
}

#[tokio::test]
async fn begin_compensation_targets_the_first_absent_guardian_and_queues_the_rest() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 2, 1).await;
	let submitter = seed_guardian(&guard.store, election_id, 0).await;
	let first_absent = seed_guardian_named(&guard.store, election_id, 1, "Guardian One").await;
	let second_absent = seed_guardian(&guard.store, election_id, 2).await;
	guard.store.upsert_partial_decryption_status(election_id, submitter, 3).await.unwrap();

	let target = guard
		.store
		.begin_compensation(election_id, submitter, &[first_absent, second_absent])
		.await
		.unwrap();
	assert_eq!(target, first_absent);

	let status = guard.store.find_partial_decryption_status(election_id, submitter).await.unwrap().unwrap();
	assert_eq!(status.current_target_guardian_id, Some(first_absent));
	assert_eq!(status.current_target_display_name.as_deref(), Some("Guardian One"));
	assert_eq!(status.total_targets, 2);
	assert_eq!(status.processed_targets, 0);
}

#[tokio::test]
async fn compensation_target_completion_advances_one_target_at_a_time_across_many_chunks() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 2, 1).await;
	let submitter = seed_guardian(&guard.store, election_id, 0).await;
	let first_absent = seed_guardian(&guard.store, election_id, 1).await;
	let second_absent = seed_guardian_named(&guard.store, election_id, 2, "Guardian Two").await;
	guard.store.upsert_partial_decryption_status(election_id, submitter, 3).await.unwrap();
	guard.store.begin_compensation(election_id, submitter, &[first_absent, second_absent]).await.unwrap();

	// A COMPENSATED job against `first_absent` spans many chunks; completion
	// must be driven by the job crossing processed+failed==total exactly
	// once, not by one call per chunk.
	let job = guard.store.create_job(election_id, OperationKind::Compensated, 4).await.unwrap();
	for _ in 0..3 {
		let (processed, failed, total) = guard.store.increment_job_progress(job.id, false).await.unwrap();
		assert!(processed + failed < total, "must not reach completion before the job's last chunk");
	}
	let (processed, failed, total) = guard.store.increment_job_progress(job.id, false).await.unwrap();
	assert_eq!(processed + failed, total);

	let (processed_targets, total_targets, next) =
		guard.store.complete_current_compensation_target(election_id, submitter).await.unwrap();
	assert_eq!((processed_targets, total_targets), (1, 2));
	assert_eq!(next, Some(second_absent));

	let status = guard.store.find_partial_decryption_status(election_id, submitter).await.unwrap().unwrap();
	assert_eq!(status.current_target_guardian_id, Some(second_absent));
	assert_eq!(status.current_target_display_name.as_deref(), Some("Guardian Two"));

	let (processed_targets, total_targets, next) =
		guard.store.complete_current_compensation_target(election_id, submitter).await.unwrap();
	assert_eq!((processed_targets, total_targets), (2, 2));
	assert_eq!(next, None, "no absent guardian remains once every target has been compensated");
}

#[tokio::test]
async fn guardian_roster_excludes_no_one_but_reports_decrypted_flags_in_sequence_order() {
	let guard = TestGuard::acquire().await;
	let election_id = seed_election(&guard.store, 2, 1).await;
	let a = seed_guardian(&guard.store, election_id, 0).await;
	let b = seed_guardian(&guard.store, election_id, 1).await;
	let c = seed_guardian(&guard.store, election_id, 2).await;
	guard.store.mark_guardian_decrypted(election_id, b).await.unwrap();

	let roster = guard.store.guardian_roster(election_id).await.unwrap();
	assert_eq!(roster, vec![(a, false), (b, true), (c, false)]);
}
