//! Shared configuration structs, deserialized from TOML and overridable by
//! environment variables. `evote-server::config` owns the CLI/file-loading
//! glue; these are the plain data shapes every crate in the workspace needs.

use serde::Deserialize;

fn default_pool_min() -> u32 {
	4
}

fn default_pool_max() -> u32 {
	28
}

fn default_pool_idle_timeout_secs() -> u64 {
	600
}

/// Postgres connection settings, covering the pool knobs a connection
/// pool needs at construction time.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
	pub url: String,
	#[serde(default = "default_pool_min")]
	pub min_connections: u32,
	#[serde(default = "default_pool_max")]
	pub max_connections: u32,
	#[serde(default = "default_pool_idle_timeout_secs")]
	pub idle_timeout_secs: u64,
}

/// AMQP broker settings for `evote-queue`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
	pub url: String,
	#[serde(default = "default_prefetch")]
	pub prefetch: u16,
}

fn default_prefetch() -> u16 {
	1
}

/// Outbound HTTP pool settings for the `CryptoClient`. `max_total` emulates
/// a hard connection cap with a `tokio::sync::Semaphore` since reqwest only
/// exposes a per-host idle cap natively.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
	#[serde(default = "default_pool_max_total")]
	pub max_total: usize,
	#[serde(default = "default_pool_acquire_timeout_secs")]
	pub acquire_timeout_secs: u64,
	#[serde(default = "default_pool_idle_per_host")]
	pub idle_per_host: usize,
	/// How long a pooled connection may sit idle before it's revalidated
	/// before reuse (spec: ~10s), not the database pool's idle timeout.
	#[serde(default = "default_crypto_pool_idle_validation_secs")]
	pub idle_timeout_secs: u64,
	#[serde(default = "default_pool_ttl_secs")]
	pub connection_ttl_secs: u64,
}

fn default_pool_max_total() -> usize {
	200
}

fn default_pool_acquire_timeout_secs() -> u64 {
	30
}

fn default_pool_idle_per_host() -> usize {
	100
}

fn default_crypto_pool_idle_validation_secs() -> u64 {
	10
}

fn default_pool_ttl_secs() -> u64 {
	120
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			max_total: default_pool_max_total(),
			acquire_timeout_secs: default_pool_acquire_timeout_secs(),
			idle_per_host: default_pool_idle_per_host(),
			idle_timeout_secs: default_crypto_pool_idle_validation_secs(),
			connection_ttl_secs: default_pool_ttl_secs(),
		}
	}
}
