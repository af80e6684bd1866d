use std::{env, io};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared across the eVote job-orchestration crates.
#[derive(Error, Debug)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("environment variable not found: {0}")]
	Env(#[from] env::VarError),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("toml parse error: {0}")]
	Toml(#[from] toml::de::Error),
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),
	#[error("migration error: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),
	#[error("amqp error: {0}")]
	Amqp(#[from] lapin::Error),
	#[error("http client error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("{0}")]
	General(String),
}

impl From<&str> for Error {
	fn from(e: &str) -> Error {
		Error::General(e.to_string())
	}
}

impl From<String> for Error {
	fn from(e: String) -> Error {
		Error::General(e)
	}
}
