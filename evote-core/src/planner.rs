//! Chunk planner: decides chunk count and materializes chunk rows using a
//! cryptographically seeded Fisher–Yates shuffle, built on `rand`'s
//! `SeedableRng`/`RngCore` split.

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use thiserror::Error;

use crate::{
	store::Store,
	types::{ChunkId, ElectionId},
};

pub const DEFAULT_CHUNK_SIZE: usize = 5000;

#[derive(Error, Debug)]
pub enum PlannerError {
	#[error("election has no cast ballots")]
	EmptyBallotSet,
	#[error("election already has a chunking")]
	AlreadyChunked,
	#[error(transparent)]
	Store(#[from] crate::error::Error),
}

/// Which strategy assigns ballot ids to their chunk. `StoreOnBallot` is the
/// default; `RederiveFromSeed` trades a write for per-request memory on
/// very large elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentMode {
	StoreOnBallot,
	RederiveFromSeed,
}

impl Default for AssignmentMode {
	fn default() -> Self {
		AssignmentMode::StoreOnBallot
	}
}

pub struct Planner {
	chunk_size: usize,
	assignment_mode: AssignmentMode,
}

impl Planner {
	pub fn new(chunk_size: usize, assignment_mode: AssignmentMode) -> Self {
		Self { chunk_size: chunk_size.max(1), assignment_mode }
	}

	pub async fn plan_tally_chunks(
		&self,
		store: &Store,
		election_id: ElectionId,
	) -> Result<Vec<ChunkId>, PlannerError> {
		if store.has_existing_chunking(election_id).await? {
			return Err(PlannerError::AlreadyChunked);
		}

		let mut ballot_ids = store.load_cast_ballot_ids(election_id).await?;
		if ballot_ids.is_empty() {
			return Err(PlannerError::EmptyBallotSet);
		}

		// Seed from a cryptographically strong source, not a deterministic
		// counter, even though the resulting shuffle is later reproducible
		// from that seed.
		let mut seed = [0u8; 32];
		rand::rngs::OsRng.fill_bytes(&mut seed);
		fisher_yates_shuffle(&mut ballot_ids, seed);

		let chunk_count = (ballot_ids.len() + self.chunk_size - 1) / self.chunk_size;
		let ordinals: Vec<i32> = (0..chunk_count as i32).collect();
		let chunk_ids = store.insert_chunks(election_id, &ordinals).await?;

		match self.assignment_mode {
			AssignmentMode::StoreOnBallot => {
				for (chunk_id, slice) in chunk_ids.iter().zip(ballot_ids.chunks(self.chunk_size)) {
					store.assign_ballots_to_chunk(*chunk_id, slice).await?;
				}
			}
			AssignmentMode::RederiveFromSeed => {
				// No per-ballot write: persist only the seed and chunk size,
				// the two inputs `Store::load_ballot_ciphertexts_for_chunk`
				// needs to replay `fisher_yates_shuffle` and re-slice by
				// ordinal on demand.
				store.set_planner_metadata(election_id, &seed, self.chunk_size as i32).await?;
			}
		}

		Ok(chunk_ids)
	}
}

/// Fisher–Yates shuffle seeded from a cryptographically strong source so
/// every permutation is equally likely. Deterministic given `seed`, which
/// is what makes `AssignmentMode::RederiveFromSeed` possible.
pub fn fisher_yates_shuffle<T>(items: &mut [T], seed: [u8; 32]) {
	let mut rng = StdRng::from_seed(seed);
	for i in (1..items.len()).rev() {
		let j = rng.gen_range(0..=i);
		items.swap(i, j);
	}
}
