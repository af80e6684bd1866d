//! Append-only audit sink interface. The core treats emission as
//! fire-and-forget: a sink failure is logged locally and never propagated
//! to the caller. Event payloads are metadata only — never ballot
//! plaintext, never private shares.

use async_trait::async_trait;
use serde::Serialize;

use crate::types::{ChunkId, ElectionId, GuardianId, JobId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
	ChunksCreated { election_id: ElectionId, total_chunks: i32 },
	TallyChunkCompleted { election_id: ElectionId, job_id: JobId, chunk_id: ChunkId },
	PartialSubmitted { election_id: ElectionId, guardian_id: GuardianId },
	GuardianCompleted { election_id: ElectionId, guardian_id: GuardianId },
	CombineCompleted { election_id: ElectionId, job_id: JobId },
}

#[async_trait]
pub trait AuditSink: Send + Sync {
	async fn emit(&self, event: AuditEvent);
}

/// Default sink: drops events. Useful for tests and for deployments that
/// route audit events through a collaborator not wired up locally.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
	async fn emit(&self, _event: AuditEvent) {}
}

/// Logs every event at `info!`, and would forward to the external
/// append-only ledger in a full deployment; failures to reach that ledger
/// are logged at `warn!` rather than surfaced to the submitting caller.
pub struct LoggingAuditSink;

#[async_trait]
impl AuditSink for LoggingAuditSink {
	async fn emit(&self, event: AuditEvent) {
		match serde_json::to_string(&event) {
			Ok(json) => log::info!("audit event: {}", json),
			Err(e) => log::warn!("failed to serialize audit event: {}", e),
		}
	}
}
