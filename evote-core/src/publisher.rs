//! Builds the four typed queues on top of `evote_queue`'s generic
//! primitive and serializes `ChunkMessage`s onto them by operation kind.

use std::sync::Arc;

use evote_queue::Publisher as QueuePublisher;

use crate::types::{ChunkMessage, OperationKind};

pub struct Publisher {
	inner: QueuePublisher,
}

impl Publisher {
	pub fn new(channel: lapin::Channel) -> Arc<Self> {
		Arc::new(Self { inner: QueuePublisher::new(channel) })
	}

	pub async fn publish(&self, operation: OperationKind, message: &ChunkMessage) -> Result<(), evote_queue::Error> {
		self.inner.publish(operation.queue_name(), message).await
	}
}
