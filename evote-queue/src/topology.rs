//! Durable-queue topology: one topic exchange, one queue per operation kind,
//! each with a dead-letter exchange, a per-message TTL and a max length.
//! Four named queues bound by routing key on a shared exchange, giving each
//! operation kind its own fair share of consumer attention.

use lapin::{
	options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
	types::{AMQPValue, FieldTable},
	Channel, Connection, ExchangeKind,
};

use crate::error::Result;

pub const EXCHANGE: &str = "evote.jobs";
const DEAD_LETTER_EXCHANGE: &str = "evote.jobs.dead";

const MESSAGE_TTL_MS: i64 = 60 * 60 * 1000;
const MAX_QUEUE_LENGTH: i64 = 100_000;

/// The four queues, one per operation kind from the job model.
pub const QUEUE_NAMES: [&str; 4] = ["tally", "partial", "compensated", "combine"];

/// Declares the exchange, the dead-letter exchange, and every operation
/// queue (plus its paired dead-letter queue) bound by routing key.
pub async fn declare(channel: &Channel) -> Result<()> {
	channel
		.exchange_declare(
			EXCHANGE,
			ExchangeKind::Topic,
			ExchangeDeclareOptions { durable: true, ..Default::default() },
			FieldTable::default(),
		)
		.await?;
	channel
		.exchange_declare(
			DEAD_LETTER_EXCHANGE,
			ExchangeKind::Topic,
			ExchangeDeclareOptions { durable: true, ..Default::default() },
			FieldTable::default(),
		)
		.await?;

	for name in QUEUE_NAMES {
		let dead_queue = format!("{}.dead", name);
		channel
			.queue_declare(
				&dead_queue,
				QueueDeclareOptions { durable: true, ..Default::default() },
				FieldTable::default(),
			)
			.await?;
		channel.queue_bind(&dead_queue, DEAD_LETTER_EXCHANGE, name, QueueBindOptions::default(), FieldTable::default()).await?;

		let mut args = FieldTable::default();
		args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(MESSAGE_TTL_MS));
		args.insert("x-max-length".into(), AMQPValue::LongLongInt(MAX_QUEUE_LENGTH));
		args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()));
		args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(name.into()));

		channel.queue_declare(name, QueueDeclareOptions { durable: true, ..Default::default() }, args).await?;
		channel.queue_bind(name, EXCHANGE, name, QueueBindOptions::default(), FieldTable::default()).await?;
	}

	Ok(())
}

pub async fn open_channel(conn: &Connection) -> Result<Channel> {
	let channel = conn.create_channel().await?;
	declare(&channel).await?;
	Ok(channel)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn queue_names_match_operation_kinds() {
		assert_eq!(QUEUE_NAMES, ["tally", "partial", "compensated", "combine"]);
	}

	#[test]
	fn ttl_and_max_length_are_spec_constants() {
		assert_eq!(MESSAGE_TTL_MS, 3_600_000);
		assert_eq!(MAX_QUEUE_LENGTH, 100_000);
	}
}
