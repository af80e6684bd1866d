//! Consume-side wrapper enforcing the prefetch=1 contract the fairness
//! proof depends on: a plain `async fn` loop over a tokio task rather than
//! a per-thread blocking consumer, matching the rest of this workspace's
//! preference for explicit tasks over a blocking threadpool.

use futures::StreamExt;
use lapin::{
	message::Delivery,
	options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
	types::FieldTable,
	Channel,
};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub struct Consumer {
	inner: lapin::Consumer,
}

impl Consumer {
	/// Opens a consumer on `queue_name` with the given prefetch count. A
	/// prefetch of 1 is what the round-robin scheduler relies on: a worker
	/// can hold at most one unacknowledged chunk at a time.
	pub async fn new(channel: &Channel, queue_name: &str, consumer_tag: &str, prefetch: u16) -> Result<Self> {
		channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
		let inner = channel
			.basic_consume(queue_name, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
			.await?;
		Ok(Self { inner })
	}

	/// Pulls the next delivery and deserializes its JSON payload.
	pub async fn next<T: DeserializeOwned>(&mut self) -> Result<(Delivery, T)> {
		let delivery = self.inner.next().await.ok_or(Error::ConsumerClosed)??;
		let payload: T = serde_json::from_slice(&delivery.data)?;
		Ok((delivery, payload))
	}

	pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
		delivery.acker.ack(BasicAckOptions::default()).await?;
		Ok(())
	}

	/// Negatively acknowledges a delivery. `requeue = false` sends the
	/// message to the queue's dead-letter exchange instead of retrying it
	/// immediately; the Scheduler, not the broker, owns retry scheduling.
	pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
		delivery.acker.nack(BasicNackOptions { requeue, ..Default::default() }).await?;
		Ok(())
	}
}
