use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
	#[error("amqp error: {0}")]
	Amqp(#[from] lapin::Error),
	#[error("failed to serialize message: {0}")]
	Encode(#[from] serde_json::Error),
	#[error("consumer closed")]
	ConsumerClosed,
}
