//! The four worker kinds. Each is a `tokio::task` consuming its queue with
//! prefetch 1: take the per-(job,chunk) redelivery lock, report PROCESSING,
//! load projection-only data, call CryptoClient, persist in its own
//! transaction, atomically advance job progress, report terminal state to
//! the Scheduler.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{
	audit::{AuditEvent, AuditSink},
	crypto_client::CryptoService,
	error::Result,
	scheduler::{FailureOutcome, Scheduler},
	store::JobStore,
	types::{ChunkId, ChunkMessage, CompensatedShare, DecryptionPhase, JobId, JobState, PartialDecryptionState, PartialShare},
	unsealer::SecretShareCache,
};

/// Per-(job, chunk) in-process lock serializing redelivered copies of the
/// same message. `entry_or_skip`: a worker that can't acquire the slot
/// drops the delivery without nacking it to the dead-letter exchange — the
/// message will be redelivered later by the broker's own retry semantics,
/// not treated as a processing failure.
#[derive(Clone, Default)]
pub struct RedeliveryLocks {
	inner: Arc<DashMap<(JobId, ChunkId), ()>>,
}

impl RedeliveryLocks {
	pub fn try_lock(&self, job_id: JobId, chunk_id: ChunkId) -> Option<RedeliveryGuard> {
		if self.inner.insert((job_id, chunk_id), ()).is_some() {
			None
		} else {
			Some(RedeliveryGuard { locks: self.inner.clone(), key: (job_id, chunk_id) })
		}
	}
}

pub struct RedeliveryGuard {
	locks: Arc<DashMap<(JobId, ChunkId), ()>>,
	key: (JobId, ChunkId),
}

impl Drop for RedeliveryGuard {
	fn drop(&mut self) {
		self.locks.remove(&self.key);
	}
}

pub struct WorkerContext {
	pub store: Arc<dyn JobStore>,
	pub scheduler: Arc<Scheduler>,
	pub crypto: Arc<dyn CryptoService>,
	pub audit: Arc<dyn AuditSink>,
	pub locks: RedeliveryLocks,
	pub secret_shares: SecretShareCache,
}

/// Marks the job `COMPLETED`/`FAILED` exactly once — called by whichever
/// worker observes `processed + failed == total` after its own increment.
/// Takes the `JobStore` seam directly (not the whole `WorkerContext`) so
/// every `process_*_chunk` function that doesn't otherwise need the
/// scheduler can be unit-tested without one.
async fn maybe_finalize_job(store: &dyn JobStore, job_id: JobId, processed: i32, failed: i32, total: i32) -> Result<()> {
	if processed + failed < total {
		return Ok(());
	}
	let state = if failed == 0 { JobState::Completed } else { JobState::Failed };
	store.mark_job_state(job_id, state, None).await?;
	Ok(())
}

/// Waits for either the next delivery or the shutdown signal, whichever
/// comes first. Checking shutdown only at this point (not mid-chunk) is
/// what lets an in-flight chunk finish and get ack'd/nack'd before the
/// worker task exits, per the drain contract the caller documents.
async fn next_or_shutdown<T>(
	consumer: &mut evote_queue::Consumer,
	shutdown: &mut watch::Receiver<bool>,
) -> Option<evote_queue::Result<(lapin::message::Delivery, T)>>
where
	T: serde::de::DeserializeOwned,
{
	if *shutdown.borrow() {
		return None;
	}
	tokio::select! {
		biased;
		_ = shutdown.changed() => None,
		next = consumer.next() => Some(next),
	}
}

pub async fn run_tally_worker(ctx: WorkerContext, mut consumer: evote_queue::Consumer, mut shutdown: watch::Receiver<bool>) {
	loop {
		let (delivery, message): (lapin::message::Delivery, ChunkMessage) = match next_or_shutdown(&mut consumer, &mut shutdown).await {
			None => {
				log::info!("tally worker draining on shutdown signal");
				break;
			}
			Some(Ok(pair)) => pair,
			Some(Err(e)) => {
				log::warn!("tally consumer error: {}", e);
				continue;
			}
		};
		let ChunkMessage::Tally { job_id, chunk_id, election_id } = message else { continue };
		let Some(_guard) = ctx.locks.try_lock(job_id, chunk_id) else { continue };

		ctx.scheduler.report_chunk_processing(job_id, chunk_id);
		let outcome =
			process_tally_chunk(ctx.store.as_ref(), ctx.crypto.as_ref(), ctx.audit.as_ref(), job_id, chunk_id, election_id)
				.await;
		finish_delivery(&ctx, &consumer, &delivery, job_id, chunk_id, outcome).await;
	}
}

async fn process_tally_chunk(
	store: &dyn JobStore,
	crypto: &dyn CryptoService,
	audit: &dyn AuditSink,
	job_id: JobId,
	chunk_id: ChunkId,
	election_id: crate::types::ElectionId,
) -> Result<()> {
	let ciphertexts = store.load_ballot_ciphertexts_for_chunk(chunk_id).await?;
	let payload = json!({ "electionId": election_id.0, "chunkId": chunk_id.0, "ballotCiphertexts": ciphertexts });
	let response: serde_json::Value = crypto.post_json("/tally", payload).await?;
	let encrypted_tally =
		response.get("encryptedTally").and_then(|v| v.as_str()).ok_or_else(|| {
			crate::error::Error::Protocol("tally response missing encryptedTally".into())
		})?;
	store.update_chunk_encrypted_tally(chunk_id, encrypted_tally).await?;

	let (processed, failed, total) = store.increment_job_progress(job_id, false).await?;
	maybe_finalize_job(store, job_id, processed, failed, total).await?;
	audit.emit(AuditEvent::TallyChunkCompleted { election_id, job_id, chunk_id }).await;
	Ok(())
}

pub async fn run_partial_worker(ctx: WorkerContext, mut consumer: evote_queue::Consumer, mut shutdown: watch::Receiver<bool>) {
	loop {
		let (delivery, message): (lapin::message::Delivery, ChunkMessage) = match next_or_shutdown(&mut consumer, &mut shutdown).await {
			None => {
				log::info!("partial worker draining on shutdown signal");
				break;
			}
			Some(Ok(pair)) => pair,
			Some(Err(e)) => {
				log::warn!("partial consumer error: {}", e);
				continue;
			}
		};
		let ChunkMessage::Partial { job_id, chunk_id, election_id, guardian_id } = message else { continue };
		let Some(_guard) = ctx.locks.try_lock(job_id, chunk_id) else { continue };

		ctx.scheduler.report_chunk_processing(job_id, chunk_id);
		let outcome = process_partial_chunk(&ctx, job_id, chunk_id, election_id, guardian_id).await;
		finish_delivery(&ctx, &consumer, &delivery, job_id, chunk_id, outcome).await;
	}
}

async fn process_partial_chunk(
	ctx: &WorkerContext,
	job_id: JobId,
	chunk_id: ChunkId,
	election_id: crate::types::ElectionId,
	guardian_id: crate::types::GuardianId,
) -> Result<()> {
	let encrypted_tally = ctx.store.load_chunk_ciphertext(chunk_id).await?;
	let ballots = ctx.store.load_ballot_ciphertexts_for_chunk(chunk_id).await?;
	let guardian_share = ctx.secret_shares.get(election_id, guardian_id).ok_or_else(|| {
		crate::error::Error::InvalidInput("guardian's unsealed share is not resident for this process".into())
	})?;
	let payload = json!({
		"electionId": election_id.0,
		"chunkId": chunk_id.0,
		"guardianId": guardian_id.0,
		"guardianSecretShare": BASE64.encode(guardian_share.as_bytes()),
		"encryptedTally": encrypted_tally,
		"ballotCiphertexts": ballots,
	});
	let response: serde_json::Value = ctx.crypto.post_json("/partial-decrypt", payload).await?;
	let share = response
		.get("share")
		.and_then(|v| v.as_str())
		.ok_or_else(|| crate::error::Error::Protocol("partial response missing share".into()))?;
	ctx.store.insert_partial_share(&PartialShare { election_id, chunk_id, guardian_id, share: share.to_string() }).await?;

	let (processed, failed, total) = ctx.store.increment_job_progress(job_id, false).await?;
	maybe_finalize_job(ctx.store.as_ref(), job_id, processed, failed, total).await?;

	let (status_processed, status_total) =
		ctx.store.increment_partial_decryption_progress(election_id, guardian_id).await?;
	if status_processed == status_total {
		let roster = ctx.store.guardian_roster(election_id).await?;
		let absent: Vec<crate::types::GuardianId> =
			roster.into_iter().filter(|(id, decrypted)| *id != guardian_id && !*decrypted).map(|(id, _)| id).collect();
		if absent.is_empty() {
			ctx.store.mark_guardian_decrypted(election_id, guardian_id).await?;
			ctx.secret_shares.evict(election_id, guardian_id);
			ctx.audit.emit(AuditEvent::GuardianCompleted { election_id, guardian_id }).await;
		} else {
			let target_guardian_id = ctx.store.begin_compensation(election_id, guardian_id, &absent).await?;
			ctx.store
				.mark_partial_decryption_status(
					election_id,
					guardian_id,
					PartialDecryptionState::InProgress,
					DecryptionPhase::Compensated,
				)
				.await?;
			dispatch_compensated_job(ctx, election_id, guardian_id, target_guardian_id).await?;
		}
	}
	Ok(())
}

/// Creates and registers a COMPENSATED job targeting `target_guardian_id` on
/// behalf of `source_guardian_id`, covering every chunk in the election.
/// Called once to enter the COMPENSATED phase and again each time
/// `complete_current_compensation_target` advances to the next absent
/// guardian.
async fn dispatch_compensated_job(
	ctx: &WorkerContext,
	election_id: crate::types::ElectionId,
	source_guardian_id: crate::types::GuardianId,
	target_guardian_id: crate::types::GuardianId,
) -> Result<()> {
	let chunk_ids = ctx.store.find_chunk_ids_by_election(election_id).await?;
	let compensated_job =
		ctx.store.create_job(election_id, crate::types::OperationKind::Compensated, chunk_ids.len() as i32).await?;
	ctx.store.mark_job_started(compensated_job.id).await?;
	ctx.scheduler.register_job(
		compensated_job.id,
		crate::types::OperationKind::Compensated,
		election_id,
		crate::scheduler::JobContext::Compensated { source_guardian_id, target_guardian_id },
		chunk_ids,
	);
	Ok(())
}

pub async fn run_compensated_worker(ctx: WorkerContext, mut consumer: evote_queue::Consumer, mut shutdown: watch::Receiver<bool>) {
	loop {
		let (delivery, message): (lapin::message::Delivery, ChunkMessage) = match next_or_shutdown(&mut consumer, &mut shutdown).await {
			None => {
				log::info!("compensated worker draining on shutdown signal");
				break;
			}
			Some(Ok(pair)) => pair,
			Some(Err(e)) => {
				log::warn!("compensated consumer error: {}", e);
				continue;
			}
		};
		let ChunkMessage::Compensated { job_id, chunk_id, election_id, source_guardian_id, target_guardian_id } = message else {
			continue;
		};
		let Some(_guard) = ctx.locks.try_lock(job_id, chunk_id) else { continue };

		ctx.scheduler.report_chunk_processing(job_id, chunk_id);
		let outcome =
			process_compensated_chunk(&ctx, job_id, chunk_id, election_id, source_guardian_id, target_guardian_id).await;
		finish_delivery(&ctx, &consumer, &delivery, job_id, chunk_id, outcome).await;
	}
}

async fn process_compensated_chunk(
	ctx: &WorkerContext,
	job_id: JobId,
	chunk_id: ChunkId,
	election_id: crate::types::ElectionId,
	source_guardian_id: crate::types::GuardianId,
	target_guardian_id: crate::types::GuardianId,
) -> Result<()> {
	let encrypted_tally = ctx.store.load_chunk_ciphertext(chunk_id).await?;
	let ballots = ctx.store.load_ballot_ciphertexts_for_chunk(chunk_id).await?;
	let source_share = ctx.secret_shares.get(election_id, source_guardian_id).ok_or_else(|| {
		crate::error::Error::InvalidInput("source guardian's unsealed share is not resident for this process".into())
	})?;
	let target = ctx.store.guardian_public_info(election_id, target_guardian_id).await?;
	let payload = json!({
		"electionId": election_id.0,
		"chunkId": chunk_id.0,
		"sourceGuardianId": source_guardian_id.0,
		"sourceGuardianSecretShare": BASE64.encode(source_share.as_bytes()),
		"sourceGuardianPolynomialBackupDigest": BASE64.encode(source_share.polynomial_backup_digest()),
		"targetGuardianId": target_guardian_id.0,
		"targetGuardianPublicKey": target.public_key,
		"targetGuardianSequenceOrder": target.sequence_number,
		"encryptedTally": encrypted_tally,
		"ballotCiphertexts": ballots,
	});
	let response: serde_json::Value = ctx.crypto.post_json("/compensated-decrypt", payload).await?;
	let share = response
		.get("share")
		.and_then(|v| v.as_str())
		.ok_or_else(|| crate::error::Error::Protocol("compensated response missing share".into()))?;
	ctx.store
		.insert_compensated_share(&CompensatedShare {
			election_id,
			chunk_id,
			source_guardian_id,
			target_guardian_id,
			share: share.to_string(),
		})
		.await?;

	// Target completion is a per-job fact (every chunk of this COMPENSATED
	// job processed or permanently failed), not a per-chunk one — a single
	// absent guardian's compensation spans every chunk in the election, so
	// this only advances once here rather than once per chunk.
	let (processed, failed, total) = ctx.store.increment_job_progress(job_id, false).await?;
	maybe_finalize_job(ctx.store.as_ref(), job_id, processed, failed, total).await?;
	if processed + failed == total {
		let (_, _, next_target) = ctx.store.complete_current_compensation_target(election_id, source_guardian_id).await?;
		match next_target {
			Some(next_target_id) => {
				dispatch_compensated_job(ctx, election_id, source_guardian_id, next_target_id).await?;
			}
			None => {
				ctx.store.mark_guardian_decrypted(election_id, source_guardian_id).await?;
				ctx.secret_shares.evict(election_id, source_guardian_id);
				ctx.audit.emit(AuditEvent::GuardianCompleted { election_id, guardian_id: source_guardian_id }).await;
			}
		}
	}
	Ok(())
}

pub async fn run_combine_worker(ctx: WorkerContext, mut consumer: evote_queue::Consumer, mut shutdown: watch::Receiver<bool>) {
	loop {
		let (delivery, message): (lapin::message::Delivery, ChunkMessage) = match next_or_shutdown(&mut consumer, &mut shutdown).await {
			None => {
				log::info!("combine worker draining on shutdown signal");
				break;
			}
			Some(Ok(pair)) => pair,
			Some(Err(e)) => {
				log::warn!("combine consumer error: {}", e);
				continue;
			}
		};
		let ChunkMessage::Combine { job_id, chunk_id, election_id } = message else { continue };
		let Some(_guard) = ctx.locks.try_lock(job_id, chunk_id) else { continue };

		ctx.scheduler.report_chunk_processing(job_id, chunk_id);
		let outcome =
			process_combine_chunk(ctx.store.as_ref(), ctx.crypto.as_ref(), ctx.audit.as_ref(), job_id, chunk_id, election_id)
				.await;
		finish_delivery(&ctx, &consumer, &delivery, job_id, chunk_id, outcome).await;
	}
}

async fn process_combine_chunk(
	store: &dyn JobStore,
	crypto: &dyn CryptoService,
	audit: &dyn AuditSink,
	job_id: JobId,
	chunk_id: ChunkId,
	election_id: crate::types::ElectionId,
) -> Result<()> {
	let quorum = store.election_quorum(election_id).await?;
	let decrypted = store.count_decrypted_guardians(election_id).await?;
	if (decrypted as i32) < quorum {
		return Err(crate::error::Error::InvalidInput("quorum not yet met".into()));
	}

	let encrypted_tally = store.load_chunk_ciphertext(chunk_id).await?;
	let partials = store.load_partial_shares_for_chunk(chunk_id).await?;
	let compensated = store.load_compensated_shares_for_chunk(chunk_id).await?;
	let payload = json!({
		"electionId": election_id.0,
		"chunkId": chunk_id.0,
		"encryptedTally": encrypted_tally,
		"partialShares": partials.iter().map(|p| json!({"guardianId": p.guardian_id.0, "share": p.share})).collect::<Vec<_>>(),
		"compensatedShares": compensated.iter().map(|c| json!({
			"sourceGuardianId": c.source_guardian_id.0,
			"targetGuardianId": c.target_guardian_id.0,
			"share": c.share,
		})).collect::<Vec<_>>(),
	});
	let response: serde_json::Value = crypto.post_json("/combine", payload).await?;
	let result = response
		.get("result")
		.cloned()
		.ok_or_else(|| crate::error::Error::Protocol("combine response missing result".into()))?;
	store.update_chunk_result(chunk_id, &result).await?;

	let (processed, failed, total) = store.increment_job_progress(job_id, false).await?;
	maybe_finalize_job(store, job_id, processed, failed, total).await?;
	if processed + failed == total {
		audit.emit(AuditEvent::CombineCompleted { election_id, job_id }).await;
	}
	Ok(())
}

/// Shared success/failure epilogue: on success, ack and report COMPLETED;
/// on failure, nack without requeue (the Scheduler's retry counter owns
/// redelivery policy, not the broker) and ask the Scheduler whether the
/// retry budget is exhausted.
#[cfg(test)]
mod tests {
	use std::{collections::HashMap, sync::Mutex as StdMutex};

	use async_trait::async_trait;

	use super::*;
	use crate::{
		audit::NoopAuditSink,
		store::{GuardianPublicInfo, JobStore},
		types::{ElectionId, GuardianId, Job, OperationKind},
	};

	/// In-memory `JobStore` double covering exactly the state
	/// `process_tally_chunk`/`process_combine_chunk` touch. Methods this
	/// test suite never calls panic rather than silently no-op, so a test
	/// that accidentally exercises an unmodeled path fails loudly instead
	/// of passing on bogus data.
	#[derive(Default)]
	struct FakeStore {
		ciphertexts: StdMutex<HashMap<ChunkId, Vec<String>>>,
		chunk_ciphertext: StdMutex<HashMap<ChunkId, String>>,
		chunk_result: StdMutex<HashMap<ChunkId, serde_json::Value>>,
		job_progress: StdMutex<HashMap<JobId, (i32, i32, i32)>>,
		job_state: StdMutex<HashMap<JobId, JobState>>,
		partial_shares: StdMutex<HashMap<ChunkId, Vec<PartialShare>>>,
		compensated_shares: StdMutex<HashMap<ChunkId, Vec<CompensatedShare>>>,
		quorum: i32,
		decrypted_guardians: i64,
	}

	#[async_trait]
	impl JobStore for FakeStore {
		async fn load_ballot_ciphertexts_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<String>> {
			Ok(self.ciphertexts.lock().unwrap().get(&chunk_id).cloned().unwrap_or_default())
		}
		async fn update_chunk_encrypted_tally(&self, chunk_id: ChunkId, ciphertext: &str) -> Result<()> {
			self.chunk_ciphertext.lock().unwrap().insert(chunk_id, ciphertext.to_string());
			Ok(())
		}
		async fn load_chunk_ciphertext(&self, chunk_id: ChunkId) -> Result<Option<String>> {
			Ok(self.chunk_ciphertext.lock().unwrap().get(&chunk_id).cloned())
		}
		async fn update_chunk_result(&self, chunk_id: ChunkId, result_json: &serde_json::Value) -> Result<()> {
			self.chunk_result.lock().unwrap().insert(chunk_id, result_json.clone());
			Ok(())
		}
		async fn find_chunk_ids_by_election(&self, _election_id: ElectionId) -> Result<Vec<ChunkId>> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn create_job(&self, _election_id: ElectionId, _operation: OperationKind, _total_chunks: i32) -> Result<Job> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn mark_job_started(&self, _job_id: JobId) -> Result<()> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn increment_job_progress(&self, job_id: JobId, failed: bool) -> Result<(i32, i32, i32)> {
			let mut progress = self.job_progress.lock().unwrap();
			let (processed, failed_count, total) = progress.get(&job_id).copied().unwrap_or((0, 0, 1));
			let updated = if failed { (processed, failed_count + 1, total) } else { (processed + 1, failed_count, total) };
			progress.insert(job_id, updated);
			Ok(updated)
		}
		async fn mark_job_state(&self, job_id: JobId, state: JobState, _error_message: Option<&str>) -> Result<()> {
			self.job_state.lock().unwrap().insert(job_id, state);
			Ok(())
		}
		async fn insert_partial_share(&self, _share: &PartialShare) -> Result<()> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn insert_compensated_share(&self, _share: &CompensatedShare) -> Result<()> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn load_partial_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<PartialShare>> {
			Ok(self.partial_shares.lock().unwrap().get(&chunk_id).cloned().unwrap_or_default())
		}
		async fn load_compensated_shares_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<CompensatedShare>> {
			Ok(self.compensated_shares.lock().unwrap().get(&chunk_id).cloned().unwrap_or_default())
		}
		async fn increment_partial_decryption_progress(&self, _election_id: ElectionId, _guardian_id: GuardianId) -> Result<(i32, i32)> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn mark_partial_decryption_status(
			&self,
			_election_id: ElectionId,
			_guardian_id: GuardianId,
			_state: PartialDecryptionState,
			_phase: DecryptionPhase,
		) -> Result<()> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn begin_compensation(&self, _election_id: ElectionId, _guardian_id: GuardianId, _absent: &[GuardianId]) -> Result<GuardianId> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn complete_current_compensation_target(
			&self,
			_election_id: ElectionId,
			_guardian_id: GuardianId,
		) -> Result<(i32, i32, Option<GuardianId>)> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn mark_guardian_decrypted(&self, _election_id: ElectionId, _guardian_id: GuardianId) -> Result<()> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn count_decrypted_guardians(&self, _election_id: ElectionId) -> Result<i64> {
			Ok(self.decrypted_guardians)
		}
		async fn election_quorum(&self, _election_id: ElectionId) -> Result<i32> {
			Ok(self.quorum)
		}
		async fn guardian_roster(&self, _election_id: ElectionId) -> Result<Vec<(GuardianId, bool)>> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
		async fn guardian_public_info(&self, _election_id: ElectionId, _guardian_id: GuardianId) -> Result<GuardianPublicInfo> {
			unimplemented!("not exercised by the tally/combine fixture tests")
		}
	}

	/// Fake crypto microservice returning a fixed, caller-supplied response
	/// body, recording the last request payload so tests can assert on it.
	struct FakeCrypto {
		response: serde_json::Value,
		last_request: StdMutex<Option<serde_json::Value>>,
	}

	impl FakeCrypto {
		fn new(response: serde_json::Value) -> Self {
			Self { response, last_request: StdMutex::new(None) }
		}
	}

	#[async_trait]
	impl CryptoService for FakeCrypto {
		async fn post_json(&self, _endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value> {
			*self.last_request.lock().unwrap() = Some(body);
			Ok(self.response.clone())
		}
	}

	fn ids() -> (JobId, ChunkId, ElectionId) {
		(JobId(uuid::Uuid::from_u128(1)), ChunkId(uuid::Uuid::from_u128(2)), ElectionId(uuid::Uuid::from_u128(3)))
	}

	/// `process_tally_chunk`/`process_combine_chunk` take the `JobStore`/
	/// `CryptoService`/`AuditSink` seams directly rather than the whole
	/// `WorkerContext`, so they can be driven here without a `Scheduler`
	/// (which would need a real AMQP-backed `Publisher`).
	/// `process_partial_chunk`/`process_compensated_chunk` do go through
	/// `dispatch_compensated_job`, which needs that scheduler — those two
	/// are covered instead at the `Store` method level in
	/// `tests/scenario.rs`, with their absent-guardian selection logic
	/// unit-tested directly below.
	#[tokio::test]
	async fn process_tally_chunk_persists_encrypted_tally_and_advances_job() {
		let (job_id, chunk_id, election_id) = ids();
		let mut store = FakeStore::default();
		store.ciphertexts.get_mut().unwrap().insert(chunk_id, vec!["ct1".into(), "ct2".into()]);
		store.job_progress.get_mut().unwrap().insert(job_id, (0, 0, 1));
		let crypto = FakeCrypto::new(json!({ "encryptedTally": "sealed-tally" }));
		let audit = NoopAuditSink;

		process_tally_chunk(&store, &crypto, &audit, job_id, chunk_id, election_id).await.unwrap();

		assert_eq!(store.chunk_ciphertext.lock().unwrap().get(&chunk_id).cloned(), Some("sealed-tally".to_string()));
		assert_eq!(store.job_state.lock().unwrap().get(&job_id).copied(), Some(JobState::Completed));
		let sent = crypto.last_request.lock().unwrap().clone().expect("tally request must have been sent");
		assert_eq!(sent["ballotCiphertexts"], json!(["ct1", "ct2"]));
	}

	#[tokio::test]
	async fn process_tally_chunk_rejects_malformed_response() {
		let (job_id, chunk_id, election_id) = ids();
		let store = FakeStore::default();
		let crypto = FakeCrypto::new(json!({ "unexpected": "shape" }));
		let audit = NoopAuditSink;

		let err = process_tally_chunk(&store, &crypto, &audit, job_id, chunk_id, election_id).await.unwrap_err();
		assert!(matches!(err, crate::error::Error::Protocol(_)));
	}

	#[tokio::test]
	async fn process_combine_chunk_rejects_when_quorum_not_met() {
		let (job_id, chunk_id, election_id) = ids();
		let store = FakeStore { quorum: 3, decrypted_guardians: 1, ..Default::default() };
		let crypto = FakeCrypto::new(json!({ "result": {} }));
		let audit = NoopAuditSink;

		let err = process_combine_chunk(&store, &crypto, &audit, job_id, chunk_id, election_id).await.unwrap_err();
		assert!(matches!(err, crate::error::Error::InvalidInput(_)));
	}

	#[tokio::test]
	async fn process_combine_chunk_persists_result_once_quorum_met() {
		let (job_id, chunk_id, election_id) = ids();
		let mut store = FakeStore { quorum: 1, decrypted_guardians: 1, ..Default::default() };
		store.chunk_ciphertext.get_mut().unwrap().insert(chunk_id, "sealed-tally".into());
		store.job_progress.get_mut().unwrap().insert(job_id, (0, 0, 1));
		let crypto = FakeCrypto::new(json!({ "result": { "tally": 42 } }));
		let audit = NoopAuditSink;

		process_combine_chunk(&store, &crypto, &audit, job_id, chunk_id, election_id).await.unwrap();

		assert_eq!(store.chunk_result.lock().unwrap().get(&chunk_id).cloned(), Some(json!({ "tally": 42 })));
	}

	/// Extracted from `process_partial_chunk`'s absent-guardian scan:
	/// verifies every present-but-not-self, not-yet-decrypted guardian is
	/// collected, in roster order, and that the submitting guardian itself
	/// is never treated as a compensation target.
	#[test]
	fn absent_guardian_scan_excludes_self_and_decrypted() {
		let me = GuardianId(uuid::Uuid::from_u128(1));
		let other_absent = GuardianId(uuid::Uuid::from_u128(2));
		let other_present = GuardianId(uuid::Uuid::from_u128(3));
		let roster = vec![(me, false), (other_absent, false), (other_present, true)];

		let absent: Vec<GuardianId> = roster.into_iter().filter(|(id, decrypted)| *id != me && !*decrypted).map(|(id, _)| id).collect();

		assert_eq!(absent, vec![other_absent]);
	}
}

async fn finish_delivery(
	ctx: &WorkerContext,
	consumer: &evote_queue::Consumer,
	delivery: &lapin::message::Delivery,
	job_id: JobId,
	chunk_id: ChunkId,
	outcome: Result<()>,
) {
	match outcome {
		Ok(()) => {
			ctx.scheduler.report_chunk_completed(job_id, chunk_id);
			if let Err(e) = consumer.ack(delivery).await {
				log::warn!("failed to ack delivery for chunk {}: {}", chunk_id, e);
			}
		}
		Err(e) => {
			log::warn!("chunk {} (job {}) failed: {}", chunk_id, job_id, e);
			let failure = ctx.scheduler.report_chunk_failed(job_id, chunk_id);
			if failure == FailureOutcome::Exhausted {
				if let Err(e) = ctx.store.increment_job_progress(job_id, true).await {
					log::warn!("failed to persist permanent chunk failure for {}: {}", chunk_id, e);
				}
			}
			if let Err(e) = consumer.nack(delivery, false).await {
				log::warn!("failed to nack delivery for chunk {}: {}", chunk_id, e);
			}
		}
	}
}
