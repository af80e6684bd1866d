//! Thin publish-side wrapper over a `lapin::Channel`, publishing onto the
//! shared topic exchange by routing key rather than a single named queue.

use lapin::{options::BasicPublishOptions, BasicProperties};
use serde::Serialize;

use crate::{error::Result, topology::EXCHANGE};

#[derive(Clone)]
pub struct Publisher {
	channel: lapin::Channel,
}

impl Publisher {
	pub fn new(channel: lapin::Channel) -> Self {
		Self { channel }
	}

	/// Serializes `message` as JSON and publishes it to `routing_key`
	/// (one of the operation-kind queue names) with persistent delivery mode.
	pub async fn publish<T: Serialize>(&self, routing_key: &str, message: &T) -> Result<()> {
		let payload = serde_json::to_vec(message)?;
		self.channel
			.basic_publish(
				EXCHANGE,
				routing_key,
				BasicPublishOptions::default(),
				&payload,
				BasicProperties::default().with_delivery_mode(2),
			)
			.await?
			.await?;
		Ok(())
	}
}
