//! Domain types shared across the planner, store, scheduler, workers and
//! tracker. Ids are `uuid::Uuid` newtypes so they can't be swapped by
//! accident at a call site; everything here is `Serialize`/`Deserialize`
//! so it can cross the broker or the HTTP boundary unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
	($name:ident) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub Uuid);

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl From<Uuid> for $name {
			fn from(u: Uuid) -> Self {
				Self(u)
			}
		}
	};
}

uuid_id!(ElectionId);
uuid_id!(GuardianId);
uuid_id!(ChunkId);
uuid_id!(JobId);

/// The four asynchronous operation kinds a `Job` can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
	Tally,
	Partial,
	Compensated,
	Combine,
}

impl OperationKind {
	/// The broker routing key / queue name this operation is dispatched on.
	pub fn queue_name(self) -> &'static str {
		match self {
			OperationKind::Tally => "tally",
			OperationKind::Partial => "partial",
			OperationKind::Compensated => "compensated",
			OperationKind::Combine => "combine",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
	Pending,
	InProgress,
	Completed,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
	Pending,
	Queued,
	Processing,
	Completed,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DecryptionPhase {
	Partial,
	Compensated,
	Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PartialDecryptionState {
	Pending,
	InProgress,
	Completed,
	Failed,
}

/// One partition of an election's cast ballots, the unit of work.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Chunk {
	pub id: ChunkId,
	pub election_id: ElectionId,
	pub ordinal: i32,
	pub encrypted_tally: Option<String>,
	pub result_json: Option<serde_json::Value>,
}

/// One asynchronous multi-chunk operation.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Job {
	pub id: JobId,
	pub election_id: ElectionId,
	pub operation: OperationKind,
	pub state: JobState,
	pub total_chunks: i32,
	pub processed_chunks: i32,
	pub failed_chunks: i32,
	pub created_at: chrono::DateTime<chrono::Utc>,
	pub started_at: Option<chrono::DateTime<chrono::Utc>>,
	pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
	pub error_message: Option<String>,
}

/// Per-guardian view of an ongoing decryption submission.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct PartialDecryptionStatus {
	pub election_id: ElectionId,
	pub guardian_id: GuardianId,
	pub state: PartialDecryptionState,
	pub phase: DecryptionPhase,
	pub total_chunks: i32,
	pub processed_chunks: i32,
	pub total_targets: i32,
	pub processed_targets: i32,
	pub current_target_guardian_id: Option<GuardianId>,
	pub current_target_display_name: Option<String>,
	/// The submitting guardian's own contact email, surfaced for the UI
	/// alongside `current_target_display_name` rather than mixed into it.
	pub guardian_contact_email: Option<String>,
	pub created_at: chrono::DateTime<chrono::Utc>,
	pub updated_at: chrono::DateTime<chrono::Utc>,
	pub error_message: Option<String>,
}

/// A guardian's partial decryption share of a chunk's encrypted tally.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct PartialShare {
	pub election_id: ElectionId,
	pub chunk_id: ChunkId,
	pub guardian_id: GuardianId,
	pub share: String,
}

/// A share one present guardian generates on behalf of an absent guardian.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CompensatedShare {
	pub election_id: ElectionId,
	pub chunk_id: ChunkId,
	pub source_guardian_id: GuardianId,
	pub target_guardian_id: GuardianId,
	pub share: String,
}

/// The in-flight broker message. No persistent identity; may be
/// redelivered. Tagged by `operation` so a single queue consumer can
/// deserialize any of the four shapes without a side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum ChunkMessage {
	#[serde(rename = "TALLY")]
	Tally { job_id: JobId, chunk_id: ChunkId, election_id: ElectionId },
	#[serde(rename = "PARTIAL")]
	Partial { job_id: JobId, chunk_id: ChunkId, election_id: ElectionId, guardian_id: GuardianId },
	#[serde(rename = "COMPENSATED")]
	Compensated {
		job_id: JobId,
		chunk_id: ChunkId,
		election_id: ElectionId,
		source_guardian_id: GuardianId,
		target_guardian_id: GuardianId,
	},
	#[serde(rename = "COMBINE")]
	Combine { job_id: JobId, chunk_id: ChunkId, election_id: ElectionId },
}

impl ChunkMessage {
	pub fn job_id(&self) -> JobId {
		match self {
			ChunkMessage::Tally { job_id, .. }
			| ChunkMessage::Partial { job_id, .. }
			| ChunkMessage::Compensated { job_id, .. }
			| ChunkMessage::Combine { job_id, .. } => *job_id,
		}
	}

	pub fn chunk_id(&self) -> ChunkId {
		match self {
			ChunkMessage::Tally { chunk_id, .. }
			| ChunkMessage::Partial { chunk_id, .. }
			| ChunkMessage::Compensated { chunk_id, .. }
			| ChunkMessage::Combine { chunk_id, .. } => *chunk_id,
		}
	}

	pub fn operation(&self) -> OperationKind {
		match self {
			ChunkMessage::Tally { .. } => OperationKind::Tally,
			ChunkMessage::Partial { .. } => OperationKind::Partial,
			ChunkMessage::Compensated { .. } => OperationKind::Compensated,
			ChunkMessage::Combine { .. } => OperationKind::Combine,
		}
	}
}
