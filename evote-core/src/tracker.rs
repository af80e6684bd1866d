//! Submission entry points: pre-validation, single-flight, and job/chunk
//! registration with the Scheduler. The pre-validation gate and the
//! in-process lock are held across validation and status-row creation to
//! close the TOCTOU window between two simultaneous submissions.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
	audit::{AuditEvent, AuditSink},
	error::{Error, Result},
	planner::Planner,
	scheduler::{JobContext, Scheduler},
	store::Store,
	types::{ElectionId, GuardianId, Job, JobId, OperationKind, PartialDecryptionStatus},
	unsealer::{CredentialUnsealer, SealedShare, SecretShareCache, UnsealedShare},
};

pub struct ProgressTracker {
	store: Arc<Store>,
	scheduler: Arc<Scheduler>,
	planner: Planner,
	audit: Arc<dyn AuditSink>,
	single_flight: DashMap<(ElectionId, GuardianId), ()>,
	secret_shares: SecretShareCache,
}

/// Outcome of a submission that may have been rejected by single-flight.
pub enum Submission {
	Accepted(JobId),
	AlreadyInProgress(Box<Job>),
	AlreadyCompleted(Box<Job>),
}

impl ProgressTracker {
	pub fn new(
		store: Arc<Store>,
		scheduler: Arc<Scheduler>,
		planner: Planner,
		audit: Arc<dyn AuditSink>,
		secret_shares: SecretShareCache,
	) -> Self {
		Self { store, scheduler, planner, audit, single_flight: DashMap::new(), secret_shares }
	}

	/// `POST /api/tally/create`. Submitting the same election twice returns
	/// the existing job id rather than creating a second chunking.
	pub async fn submit_tally(&self, election_id: ElectionId) -> Result<Submission> {
		if let Some(job) = self.store.find_job_for_election(election_id, OperationKind::Tally).await? {
			return Ok(match job.state {
				crate::types::JobState::Completed => Submission::AlreadyCompleted(Box::new(job)),
				_ => Submission::AlreadyInProgress(Box::new(job)),
			});
		}

		let chunk_ids = self
			.planner
			.plan_tally_chunks(&self.store, election_id)
			.await
			.map_err(|e| match e {
				crate::planner::PlannerError::EmptyBallotSet => {
					Error::InvalidInput("election has no cast ballots".into())
				}
				crate::planner::PlannerError::AlreadyChunked => Error::DuplicateSubmission,
				crate::planner::PlannerError::Store(e) => e,
			})?;

		let job = self.store.create_job(election_id, OperationKind::Tally, chunk_ids.len() as i32).await?;
		self.store.mark_job_started(job.id).await?;
		self.scheduler.register_job(job.id, OperationKind::Tally, election_id, JobContext::Tally, chunk_ids.clone());
		self.audit.emit(AuditEvent::ChunksCreated { election_id, total_chunks: chunk_ids.len() as i32 }).await;
		Ok(Submission::Accepted(job.id))
	}

	/// `POST /api/guardian/initiate-decryption`. Validates the credential
	/// synchronously before any broker traffic occurs; a bad credential
	/// never reaches the scheduler.
	pub async fn initiate_decryption(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		credential_blob: &[u8],
		sealed_share: &SealedShare,
	) -> Result<Submission> {
		let key = (election_id, guardian_id);
		if self.single_flight.contains_key(&key) {
			return Err(Error::DuplicateSubmission);
		}
		self.single_flight.insert(key, ());
		let result = self.initiate_decryption_locked(election_id, guardian_id, credential_blob, sealed_share).await;
		self.single_flight.remove(&key);
		result
	}

	async fn initiate_decryption_locked(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
		credential_blob: &[u8],
		sealed_share: &SealedShare,
	) -> Result<Submission> {
		if let Some(status) = self.store.find_partial_decryption_status(election_id, guardian_id).await? {
			match status.state {
				crate::types::PartialDecryptionState::InProgress | crate::types::PartialDecryptionState::Pending => {
					return Err(Error::DuplicateSubmission);
				}
				crate::types::PartialDecryptionState::Completed => return Err(Error::DuplicateSubmission),
				crate::types::PartialDecryptionState::Failed => {}
			}
		}

		let unsealed: UnsealedShare = match CredentialUnsealer::unseal(credential_blob, sealed_share) {
			Ok(u) => u,
			Err(_) => {
				self.store
					.mark_partial_decryption_status_failed(
						election_id,
						guardian_id,
						"The credential file you provided is incorrect. Please upload the correct file that was sent to you via email.",
					)
					.await?;
				return Err(Error::InvalidCredential);
			}
		};
		// Cached in-process, never on the broker or in the database; the
		// PARTIAL and (later) COMPENSATED workers for this guardian consult
		// it per chunk and it is evicted (zeroizing the bytes) once the
		// guardian's decryption reaches a terminal state.
		self.secret_shares.insert(election_id, guardian_id, unsealed);

		let chunk_ids = self.store.find_chunk_ids_by_election(election_id).await?;
		if chunk_ids.is_empty() {
			return Err(Error::InvalidInput("election has not been chunked".into()));
		}

		let job = self.store.create_job(election_id, OperationKind::Partial, chunk_ids.len() as i32).await?;
		self.store.mark_job_started(job.id).await?;
		self.store.upsert_partial_decryption_status(election_id, guardian_id, chunk_ids.len() as i32).await?;
		self.scheduler.register_job(
			job.id,
			OperationKind::Partial,
			election_id,
			JobContext::Partial { guardian_id },
			chunk_ids,
		);
		self.audit.emit(AuditEvent::PartialSubmitted { election_id, guardian_id }).await;
		Ok(Submission::Accepted(job.id))
	}

	/// `POST /api/combine/decryption`.
	pub async fn submit_combine(&self, election_id: ElectionId) -> Result<Submission> {
		let quorum = self.store.election_quorum(election_id).await?;
		let decrypted = self.store.count_decrypted_guardians(election_id).await?;
		if (decrypted as i32) < quorum {
			return Err(Error::InvalidInput(format!(
				"only {} of {} required guardians have completed decryption",
				decrypted, quorum
			)));
		}

		if let Some(job) = self.store.find_job_for_election(election_id, OperationKind::Combine).await? {
			return Ok(match job.state {
				crate::types::JobState::Completed => Submission::AlreadyCompleted(Box::new(job)),
				_ => Submission::AlreadyInProgress(Box::new(job)),
			});
		}

		let chunk_ids = self.store.find_chunk_ids_by_election(election_id).await?;
		let job = self.store.create_job(election_id, OperationKind::Combine, chunk_ids.len() as i32).await?;
		self.store.mark_job_started(job.id).await?;
		self.scheduler.register_job(job.id, OperationKind::Combine, election_id, JobContext::Combine, chunk_ids);
		Ok(Submission::Accepted(job.id))
	}

	pub async fn decryption_status(
		&self,
		election_id: ElectionId,
		guardian_id: GuardianId,
	) -> Result<Option<PartialDecryptionStatus>> {
		self.store.find_partial_decryption_status(election_id, guardian_id).await
	}

	pub async fn job_status(&self, job_id: JobId) -> Result<Job> {
		self.store.load_job(job_id).await
	}
}
