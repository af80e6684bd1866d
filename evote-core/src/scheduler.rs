//! Fair round-robin dispatcher. Explicitly-constructed singleton with a
//! `start`/`stop` lifecycle, built from a plain `tokio` task rather than an
//! actor framework: a periodic tick plus a shutdown-signal channel, in
//! preference to coroutine/actor machinery.

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch};

use crate::{
	publisher::Publisher,
	types::{ChunkId, ChunkMessage, ChunkState, ElectionId, GuardianId, JobId, OperationKind},
};

const MAX_RETRIES: u8 = 3;
const RETRY_BACKOFFS: [Duration; 3] = [Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20)];

/// What extra identity a chunk message needs beyond job/chunk/election,
/// depending on the job's operation kind.
#[derive(Debug, Clone)]
pub enum JobContext {
	Tally,
	Partial { guardian_id: GuardianId },
	Compensated { source_guardian_id: GuardianId, target_guardian_id: GuardianId },
	Combine,
}

#[derive(Debug, Clone)]
struct ChunkEntry {
	chunk_id: ChunkId,
	state: ChunkState,
	retry_count: u8,
}

struct JobInstance {
	job_id: JobId,
	operation: OperationKind,
	election_id: ElectionId,
	context: JobContext,
	chunks: Vec<ChunkEntry>,
}

impl JobInstance {
	fn has_non_terminal_chunk(&self) -> bool {
		self.chunks.iter().any(|c| !matches!(c.state, ChunkState::Completed | ChunkState::Failed))
	}

	fn build_message(&self, chunk_id: ChunkId) -> ChunkMessage {
		match &self.context {
			JobContext::Tally => ChunkMessage::Tally { job_id: self.job_id, chunk_id, election_id: self.election_id },
			JobContext::Partial { guardian_id } => {
				ChunkMessage::Partial { job_id: self.job_id, chunk_id, election_id: self.election_id, guardian_id: *guardian_id }
			}
			JobContext::Compensated { source_guardian_id, target_guardian_id } => ChunkMessage::Compensated {
				job_id: self.job_id,
				chunk_id,
				election_id: self.election_id,
				source_guardian_id: *source_guardian_id,
				target_guardian_id: *target_guardian_id,
			},
			JobContext::Combine => ChunkMessage::Combine { job_id: self.job_id, chunk_id, election_id: self.election_id },
		}
	}
}

/// The outcome `report_chunk_failed` hands back so the caller (a worker)
/// knows whether to perform the one-time durable "permanently failed"
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
	WillRetry,
	Exhausted,
}

enum RetryMsg {
	Requeue(JobId, ChunkId),
}

/// Pure retry-budget decision: a chunk whose post-increment retry count has
/// reached `MAX_RETRIES` is exhausted, otherwise it will be requeued after
/// `RETRY_BACKOFFS[retry_count - 1]`. Split out of `report_chunk_failed` so
/// the retry-exhaustion invariant is testable without spawning a task or
/// constructing a `Scheduler`.
fn classify_retry(retry_count: u8) -> FailureOutcome {
	if retry_count >= MAX_RETRIES {
		FailureOutcome::Exhausted
	} else {
		FailureOutcome::WillRetry
	}
}

pub struct Scheduler {
	registry: Arc<DashMap<JobId, SyncMutex<JobInstance>>>,
	order: Arc<SyncMutex<Vec<JobId>>>,
	round_robin_index: AtomicUsize,
	publisher: Arc<Publisher>,
	tick_interval: Duration,
	retry_tx: mpsc::UnboundedSender<RetryMsg>,
	shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
	pub fn new(publisher: Arc<Publisher>, tick_interval: Duration) -> Arc<Self> {
		let (retry_tx, retry_rx) = mpsc::unbounded_channel();
		let (shutdown_tx, _) = watch::channel(false);

		let this = Arc::new(Self {
			registry: Arc::new(DashMap::new()),
			order: Arc::new(SyncMutex::new(Vec::new())),
			round_robin_index: AtomicUsize::new(0),
			publisher,
			tick_interval,
			retry_tx,
			shutdown_tx,
		});
		this.clone().spawn_retry_task(retry_rx);
		this
	}

	/// Registers a new active job instance at the end of the insertion
	/// order. Called once per job, right after the planner/store have
	/// created its chunk rows.
	pub fn register_job(
		&self,
		job_id: JobId,
		operation: OperationKind,
		election_id: ElectionId,
		context: JobContext,
		chunk_ids: Vec<ChunkId>,
	) {
		let chunks = chunk_ids
			.into_iter()
			.map(|chunk_id| ChunkEntry { chunk_id, state: ChunkState::Pending, retry_count: 0 })
			.collect();
		self.registry.insert(job_id, SyncMutex::new(JobInstance { job_id, operation, election_id, context, chunks }));
		self.order.lock().push(job_id);
	}

	pub fn report_chunk_processing(&self, job_id: JobId, chunk_id: ChunkId) {
		self.with_chunk(job_id, chunk_id, |entry| entry.state = ChunkState::Processing);
	}

	pub fn report_chunk_completed(&self, job_id: JobId, chunk_id: ChunkId) {
		self.with_chunk(job_id, chunk_id, |entry| entry.state = ChunkState::Completed);
		self.drop_if_drained(job_id);
	}

	/// Increments the retry counter. Below `MAX_RETRIES` the chunk is
	/// scheduled to return to `PENDING`, appended to the end of its
	/// instance's chunk list (the open question on retry ordering is
	/// resolved that way, recorded in DESIGN.md) after the exponential
	/// backoff elapses. At `MAX_RETRIES` the chunk is marked permanently
	/// `FAILED` and `FailureOutcome::Exhausted` is returned so the caller
	/// performs the one-time durable `failed_chunks` increment.
	pub fn report_chunk_failed(&self, job_id: JobId, chunk_id: ChunkId) -> FailureOutcome {
		let retry_count = match self.registry.get(&job_id) {
			Some(instance) => {
				let mut instance = instance.lock();
				if let Some(entry) = instance.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) {
					entry.retry_count += 1;
					entry.retry_count
				} else {
					return FailureOutcome::Exhausted;
				}
			}
			None => return FailureOutcome::Exhausted,
		};

		match classify_retry(retry_count) {
			FailureOutcome::Exhausted => {
				self.with_chunk(job_id, chunk_id, |entry| entry.state = ChunkState::Failed);
				self.drop_if_drained(job_id);
				FailureOutcome::Exhausted
			}
			FailureOutcome::WillRetry => {
				let backoff = RETRY_BACKOFFS[(retry_count - 1) as usize];
				let retry_tx = self.retry_tx.clone();
				tokio::spawn(async move {
					tokio::time::sleep(backoff).await;
					let _ = retry_tx.send(RetryMsg::Requeue(job_id, chunk_id));
				});
				FailureOutcome::WillRetry
			}
		}
	}

	fn with_chunk(&self, job_id: JobId, chunk_id: ChunkId, f: impl FnOnce(&mut ChunkEntry)) {
		if let Some(instance) = self.registry.get(&job_id) {
			let mut instance = instance.lock();
			if let Some(entry) = instance.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) {
				f(entry);
			}
		}
	}

	fn drop_if_drained(&self, job_id: JobId) {
		let drained = self.registry.get(&job_id).map(|i| !i.lock().has_non_terminal_chunk()).unwrap_or(false);
		if drained {
			self.registry.remove(&job_id);
			self.order.lock().retain(|id| *id != job_id);
		}
	}

	fn spawn_retry_task(self: Arc<Self>, mut retry_rx: mpsc::UnboundedReceiver<RetryMsg>) {
		tokio::spawn(async move {
			while let Some(RetryMsg::Requeue(job_id, chunk_id)) = retry_rx.recv().await {
				if let Some(instance) = self.registry.get(&job_id) {
					let mut instance = instance.lock();
					if let Some(pos) = instance.chunks.iter().position(|c| c.chunk_id == chunk_id) {
						let mut entry = instance.chunks.remove(pos);
						entry.state = ChunkState::Pending;
						instance.chunks.push(entry);
					}
				}
			}
		});
	}

	/// Starts the tick loop on a dedicated task. Returns immediately; call
	/// `stop` to drain it gracefully.
	pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.tick_interval);
			loop {
				tokio::select! {
					_ = interval.tick() => {
						if let Err(e) = self.tick().await {
							log::warn!("scheduler tick failed to publish: {}", e);
						}
					}
					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							log::info!("scheduler tick loop draining on shutdown signal");
							break;
						}
					}
				}
			}
		})
	}

	pub fn stop(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	/// One iteration: snapshot the registration order, starting at
	/// `roundRobinIndex mod len`, and publish at most one `PENDING` chunk
	/// per instance.
	async fn tick(&self) -> Result<(), evote_queue::Error> {
		let picks = select_round(&self.order, &self.registry, &self.round_robin_index);
		for (operation, message) in picks {
			self.publisher.publish(operation, &message).await?;
		}
		Ok(())
	}
}

/// The pure round-robin selection `tick()` drives: snapshot the
/// registration order, starting at `round_robin_index mod len`, mark at
/// most one `PENDING` chunk per instance as `Queued` and build its
/// message. Kept free of `Scheduler`/`Publisher` so the fairness
/// invariants (no-starvation, bounded unfairness, determinism) can be
/// tested directly against a `DashMap`/`Vec`/`AtomicUsize` triple without
/// opening an AMQP channel.
fn select_round(
	order: &SyncMutex<Vec<JobId>>,
	registry: &DashMap<JobId, SyncMutex<JobInstance>>,
	round_robin_index: &AtomicUsize,
) -> Vec<(OperationKind, ChunkMessage)> {
	let order = order.lock().clone();
	if order.is_empty() {
		return Vec::new();
	}

	let len = order.len();
	let start = round_robin_index.load(Ordering::Relaxed) % len;

	let mut picks = Vec::new();
	for k in 0..len {
		let job_id = order[(start + k) % len];
		if let Some(instance) = registry.get(&job_id) {
			let mut instance = instance.lock();
			if let Some(entry) = instance.chunks.iter_mut().find(|c| c.state == ChunkState::Pending) {
				entry.state = ChunkState::Queued;
				let message = instance.build_message(entry.chunk_id);
				picks.push((instance.operation, message));
			}
		}
	}

	round_robin_index.fetch_add(1, Ordering::Relaxed);
	picks
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(id: u128, state: ChunkState) -> ChunkEntry {
		ChunkEntry { chunk_id: ChunkId(uuid::Uuid::from_u128(id)), state, retry_count: 0 }
	}

	#[test]
	fn has_non_terminal_chunk_detects_pending_and_processing() {
		let instance = JobInstance {
			job_id: JobId(uuid::Uuid::from_u128(1)),
			operation: OperationKind::Tally,
			election_id: ElectionId(uuid::Uuid::from_u128(2)),
			context: JobContext::Tally,
			chunks: vec![entry(1, ChunkState::Completed), entry(2, ChunkState::Processing)],
		};
		assert!(instance.has_non_terminal_chunk());
	}

	#[test]
	fn drained_when_all_terminal() {
		let instance = JobInstance {
			job_id: JobId(uuid::Uuid::from_u128(1)),
			operation: OperationKind::Tally,
			election_id: ElectionId(uuid::Uuid::from_u128(2)),
			context: JobContext::Tally,
			chunks: vec![entry(1, ChunkState::Completed), entry(2, ChunkState::Failed)],
		};
		assert!(!instance.has_non_terminal_chunk());
	}

	fn pending_job(job_ordinal: u128, n_chunks: u32) -> (JobId, SyncMutex<JobInstance>) {
		let job_id = JobId(uuid::Uuid::from_u128(job_ordinal));
		let chunks =
			(0..n_chunks).map(|i| entry(job_ordinal * 100 + i as u128, ChunkState::Pending)).collect::<Vec<_>>();
		(
			job_id,
			SyncMutex::new(JobInstance {
				job_id,
				operation: OperationKind::Tally,
				election_id: ElectionId(uuid::Uuid::from_u128(999)),
				context: JobContext::Tally,
				chunks,
			}),
		)
	}

	fn registry_of(jobs: Vec<(JobId, SyncMutex<JobInstance>)>) -> (DashMap<JobId, SyncMutex<JobInstance>>, Vec<JobId>) {
		let order = jobs.iter().map(|(id, _)| *id).collect();
		let registry = DashMap::new();
		for (id, instance) in jobs {
			registry.insert(id, instance);
		}
		(registry, order)
	}

	#[test]
	fn select_round_dispatches_one_chunk_per_job_no_starvation() {
		let (registry, order) = registry_of(vec![pending_job(1, 3), pending_job(2, 1), pending_job(3, 2)]);
		let order = SyncMutex::new(order);
		let index = AtomicUsize::new(0);

		let picks = select_round(&order, &registry, &index);
		assert_eq!(picks.len(), 3, "every job with a pending chunk gets exactly one pick per round");
	}

	#[test]
	fn select_round_is_deterministic_for_a_fixed_index() {
		let (registry_a, order_a) = registry_of(vec![pending_job(1, 2), pending_job(2, 2)]);
		let (registry_b, order_b) = registry_of(vec![pending_job(1, 2), pending_job(2, 2)]);
		let picks_a = select_round(&SyncMutex::new(order_a), &registry_a, &AtomicUsize::new(0));
		let picks_b = select_round(&SyncMutex::new(order_b), &registry_b, &AtomicUsize::new(0));
		let ids_a: Vec<_> = picks_a.iter().map(|(_, m)| m.chunk_id()).collect();
		let ids_b: Vec<_> = picks_b.iter().map(|(_, m)| m.chunk_id()).collect();
		assert_eq!(ids_a, ids_b, "identical starting state at the same round-robin index picks identical chunks");
	}

	#[test]
	fn select_round_rotates_start_position_for_bounded_unfairness() {
		let (registry, order) = registry_of(vec![pending_job(1, 5), pending_job(2, 5)]);
		let order = SyncMutex::new(order);
		let index = AtomicUsize::new(0);

		let first_round = select_round(&order, &registry, &index);
		let second_round = select_round(&order, &registry, &index);
		let first_job_order: Vec<_> = first_round.iter().map(|(_, m)| m.job_id()).collect();
		let second_job_order: Vec<_> = second_round.iter().map(|(_, m)| m.job_id()).collect();
		assert_ne!(
			first_job_order, second_job_order,
			"round_robin_index advancing each tick means no single job is always picked first"
		);
	}

	#[test]
	fn select_round_skips_jobs_with_no_pending_chunk() {
		let (job_id, instance) = pending_job(1, 1);
		{
			let mut locked = instance.lock();
			locked.chunks[0].state = ChunkState::Processing;
		}
		let registry = DashMap::new();
		registry.insert(job_id, instance);
		let order = SyncMutex::new(vec![job_id]);

		let picks = select_round(&order, &registry, &AtomicUsize::new(0));
		assert!(picks.is_empty());
	}

	#[test]
	fn retry_budget_exhausts_at_max_retries() {
		assert_eq!(classify_retry(1), FailureOutcome::WillRetry);
		assert_eq!(classify_retry(2), FailureOutcome::WillRetry);
		assert_eq!(classify_retry(MAX_RETRIES), FailureOutcome::Exhausted);
		assert_eq!(RETRY_BACKOFFS.len() as u8, MAX_RETRIES);
	}
}
