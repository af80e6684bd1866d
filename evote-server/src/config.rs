//! TOML config loading plus environment-variable overrides: an optional
//! file is parsed into a `TomlConfig`, then merged with environment
//! variables and CLI flags into the `Config` the rest of the binary reads.
//! Carries chunk size, scheduler tick interval, worker concurrency,
//! connection-pool totals, and the external service URLs.

use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use evote_common::{DatabaseConfig, PoolConfig, QueueConfig};
use evote_core::AssignmentMode;

use crate::cli_opts::CliOpts;

fn default_chunk_size() -> usize {
	evote_core::planner::DEFAULT_CHUNK_SIZE
}

fn default_tick_interval_ms() -> u64 {
	100
}

fn default_worker_concurrency() -> usize {
	6
}

fn default_bind_addr() -> String {
	"0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct TomlConfig {
	database: DatabaseConfig,
	queue: QueueConfig,
	#[serde(default)]
	crypto_pool: PoolConfig,
	crypto_base_url: String,
	#[serde(default = "default_bind_addr")]
	bind_addr: String,
	#[serde(default = "default_chunk_size")]
	chunk_size: usize,
	#[serde(default = "default_tick_interval_ms")]
	tick_interval_ms: u64,
	/// Concurrent consumer tasks per queue, applied identically to all four
	/// operation queues.
	#[serde(default = "default_worker_concurrency")]
	worker_concurrency: usize,
	#[serde(default)]
	rederive_ballot_assignment: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub database: DatabaseConfig,
	pub queue: QueueConfig,
	pub crypto_pool: PoolConfig,
	pub crypto_base_url: String,
	pub bind_addr: String,
	pub chunk_size: usize,
	pub tick_interval_ms: u64,
	pub worker_concurrency: usize,
	pub assignment_mode: AssignmentMode,
	pub migrate_only: bool,
}

impl Config {
	/// Loads the optional TOML file named by `--config`/`EVOTE_CONFIG`, then
	/// layers environment-variable and CLI overrides on top. Required keys
	/// (`database.url`, `queue.url`, `crypto_base_url`) must come from the
	/// file or `EVOTE_DATABASE_URL`/`EVOTE_QUEUE_URL`/`EVOTE_CRYPTO_BASE_URL`.
	pub fn load(cli: &CliOpts) -> Result<Self> {
		let toml_conf = match &cli.config {
			Some(path) => Some(Self::parse_file(path)?),
			None => None,
		};

		let database = match toml_conf.as_ref() {
			Some(c) => c.database.clone(),
			None => DatabaseConfig {
				url: std::env::var("EVOTE_DATABASE_URL")?,
				min_connections: 4,
				max_connections: 28,
				idle_timeout_secs: 600,
			},
		};
		let queue = match toml_conf.as_ref() {
			Some(c) => c.queue.clone(),
			None => QueueConfig { url: std::env::var("EVOTE_QUEUE_URL")?, prefetch: 1 },
		};
		let crypto_base_url = match toml_conf.as_ref() {
			Some(c) => c.crypto_base_url.clone(),
			None => std::env::var("EVOTE_CRYPTO_BASE_URL")?,
		};

		let bind_addr = cli
			.bind_addr
			.clone()
			.or_else(|| toml_conf.as_ref().map(|c| c.bind_addr.clone()))
			.unwrap_or_else(default_bind_addr);

		let assignment_mode = toml_conf
			.as_ref()
			.map(|c| {
				if c.rederive_ballot_assignment {
					AssignmentMode::RederiveFromSeed
				} else {
					AssignmentMode::StoreOnBallot
				}
			})
			.unwrap_or_default();

		Ok(Self {
			database,
			queue,
			crypto_pool: toml_conf.as_ref().map(|c| c.crypto_pool.clone()).unwrap_or_default(),
			crypto_base_url,
			bind_addr,
			chunk_size: toml_conf.as_ref().map(|c| c.chunk_size).unwrap_or_else(default_chunk_size),
			tick_interval_ms: toml_conf.as_ref().map(|c| c.tick_interval_ms).unwrap_or_else(default_tick_interval_ms),
			worker_concurrency: toml_conf
				.as_ref()
				.map(|c| c.worker_concurrency)
				.unwrap_or_else(default_worker_concurrency),
			assignment_mode,
			migrate_only: cli.migrate_only,
		})
	}

	fn parse_file(path: &Path) -> Result<TomlConfig> {
		let toml_str = std::fs::read_to_string(path)?;
		Ok(toml::from_str(toml_str.as_str())?)
	}
}
