//! Process entrypoint: parses CLI flags, loads config, runs embedded
//! migrations, wires the Store/Scheduler/Publisher/CryptoClient/
//! ProgressTracker, spawns the four worker pools, and serves the
//! Admin/Status HTTP API. Shutdown is driven by `tokio::main` and `axum`'s
//! graceful shutdown future rather than a blocking spin loop, so the
//! Scheduler's own `start`/`stop` lifecycle has an async point to drain into.

mod cli_opts;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use evote_core::{
	audit::LoggingAuditSink,
	crypto_client::{CryptoClient, CryptoClientConfig},
	publisher::Publisher,
	scheduler::Scheduler,
	store::{self, Store},
	tracker::ProgressTracker,
	worker::{RedeliveryLocks, WorkerContext},
	Planner,
};

use cli_opts::CliOpts;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
	let cli = CliOpts::parse_args();
	evote_common::util::init_logger(cli.log_level(), log::LevelFilter::Debug)
		.context("failed to initialize logging")?;

	let config = Config::load(&cli)?;
	store::migrate(&config.database.url).await.context("failed to run database migrations")?;
	if config.migrate_only {
		log::info!("migrate-only mode: migrations applied, exiting");
		return Ok(());
	}

	let store = Arc::new(
		Store::connect(
			&config.database.url,
			config.database.min_connections,
			config.database.max_connections,
			Duration::from_secs(config.database.idle_timeout_secs),
		)
		.await
		.context("failed to connect to database")?,
	);

	let amqp_conn = lapin::Connection::connect(&config.queue.url, lapin::ConnectionProperties::default())
		.await
		.context("failed to connect to broker")?;
	let publish_channel = evote_queue::open_channel(&amqp_conn).await.context("failed to open publish channel")?;
	let publisher = Publisher::new(publish_channel);

	let scheduler = Scheduler::new(publisher, Duration::from_millis(config.tick_interval_ms));
	let scheduler_task = scheduler.clone().start();

	let crypto = CryptoClient::new(CryptoClientConfig {
		base_url: config.crypto_base_url.clone(),
		max_total_connections: config.crypto_pool.max_total,
		max_idle_per_host: config.crypto_pool.idle_per_host,
		acquire_timeout: Duration::from_secs(config.crypto_pool.acquire_timeout_secs),
		response_timeout: Duration::from_secs(600),
		idle_timeout: Duration::from_secs(config.crypto_pool.idle_timeout_secs),
		connection_ttl: Duration::from_secs(config.crypto_pool.connection_ttl_secs),
	})
	.context("failed to build crypto client")?;

	let audit: Arc<dyn evote_core::audit::AuditSink> = Arc::new(LoggingAuditSink);
	let planner = Planner::new(config.chunk_size, config.assignment_mode);
	let secret_shares = evote_core::SecretShareCache::new();
	let tracker =
		Arc::new(ProgressTracker::new(store.clone(), scheduler.clone(), planner, audit.clone(), secret_shares.clone()));

	let locks = RedeliveryLocks::default();
	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	let worker_tasks = spawn_workers(
		&amqp_conn,
		&store,
		&scheduler,
		&crypto,
		&audit,
		&locks,
		&secret_shares,
		config.worker_concurrency,
		&shutdown_rx,
	)
	.await?;

	let state = evote_api::AppState::new(store.clone(), tracker.clone());
	let app = evote_api::router(state);
	let addr = config.bind_addr.parse().context("invalid bind address")?;
	log::info!("evote-server listening on {}", addr);

	axum::Server::bind(&addr)
		.serve(app.into_make_service())
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("HTTP server error")?;

	log::info!("draining scheduler and worker pool");
	scheduler.stop();
	let _ = scheduler_task.await;
	// Signal every consumer task to stop pulling new deliveries, then join
	// (not abort) them, so a chunk already in flight finishes and gets
	// ack'd/nack'd instead of being interrupted mid-processing.
	let _ = shutdown_tx.send(true);
	for task in worker_tasks {
		if let Err(e) = task.await {
			log::warn!("worker task panicked during shutdown: {}", e);
		}
	}
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	log::info!("shutdown signal received");
}

/// Spawns `concurrency` consumer tasks per operation queue, each on its
/// own AMQP channel with prefetch 1, the contract the round-robin
/// fairness proof depends on.
async fn spawn_workers(
	amqp_conn: &lapin::Connection,
	store: &Arc<Store>,
	scheduler: &Arc<Scheduler>,
	crypto: &Arc<CryptoClient>,
	audit: &Arc<dyn evote_core::audit::AuditSink>,
	locks: &RedeliveryLocks,
	secret_shares: &evote_core::SecretShareCache,
	concurrency: usize,
	shutdown_rx: &tokio::sync::watch::Receiver<bool>,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
	let mut tasks = Vec::new();
	for (index, queue_name) in evote_queue::QUEUE_NAMES.into_iter().enumerate() {
		for consumer_index in 0..concurrency {
			let channel = amqp_conn.create_channel().await.context("failed to open consumer channel")?;
			let consumer_tag = format!("evote-{}-{}", queue_name, consumer_index);
			let consumer = evote_queue::Consumer::new(&channel, queue_name, &consumer_tag, 1)
				.await
				.context("failed to open consumer")?;
			let ctx = WorkerContext {
				store: store.clone(),
				scheduler: scheduler.clone(),
				crypto: crypto.clone(),
				audit: audit.clone(),
				locks: locks.clone(),
				secret_shares: secret_shares.clone(),
			};
			let shutdown = shutdown_rx.clone();
			let task = match index {
				0 => tokio::spawn(evote_core::worker::run_tally_worker(ctx, consumer, shutdown)),
				1 => tokio::spawn(evote_core::worker::run_partial_worker(ctx, consumer, shutdown)),
				2 => tokio::spawn(evote_core::worker::run_compensated_worker(ctx, consumer, shutdown)),
				3 => tokio::spawn(evote_core::worker::run_combine_worker(ctx, consumer, shutdown)),
				_ => unreachable!("exactly four operation queues"),
			};
			tasks.push(task);
		}
	}
	Ok(tasks)
}
