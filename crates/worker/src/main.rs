//! Portray Worker
//!
//! Drains the job store:
//! 1. Reclaims stale locks left by crashed workers
//! 2. Claims the oldest eligible job
//! 3. Generates and uploads its images, persisting photo rows
//! 4. Finalizes job and batch state
//!
//! Parallelism comes from running more worker processes; each process runs
//! a single claim/process loop. The SQS queue and the intake endpoint only
//! wake the loop early - store polling alone is sufficient for correctness.

mod fetch;
mod processor;
mod webhook;

use crate::fetch::HttpImageFetcher;
use crate::processor::{JobProcessor, ProcessorConfig};
use portray_common::{
    blob::create_blob_store,
    config::AppConfig,
    db::create_store,
    genapi::create_generator,
    metrics,
    queue::{JobAvailableMessage, Queue, QueueConfig},
    retry::RetryPolicy,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config);

    info!("Starting Portray Worker v{}", portray_common::VERSION);

    let config = Arc::new(config);

    // Initialize metrics
    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
    }

    // Initialize the store
    info!("Connecting to store...");
    let store = create_store(&config.database).await?;

    // Initialize the generation client
    let policy = RetryPolicy::new(
        config.generation.max_retries,
        Duration::from_millis(config.generation.backoff_base_ms),
        Duration::from_millis(config.generation.backoff_max_ms),
        Duration::from_millis(config.generation.jitter_ms),
    );

    let generator = create_generator(
        &config.generation.provider,
        config.generation.api_key.clone(),
        Some(config.generation.model.clone()),
        config.generation.api_base.clone(),
        Duration::from_secs(config.generation.timeout_secs),
        policy.clone(),
        Duration::from_millis(config.generation.rate_limit_fallback_ms),
    );

    info!(model = %generator.model_name(), "Generation client initialized");

    // Initialize blob storage
    let blobs = create_blob_store(
        &config.storage.provider,
        config.storage.bucket.clone(),
        config.storage.public_base_url.clone(),
    )
    .await;

    // Initialize the processor
    let fetcher = Arc::new(HttpImageFetcher::new(Duration::from_secs(30)));
    let processor = JobProcessor::new(
        store.clone(),
        generator,
        blobs,
        fetcher,
        ProcessorConfig {
            inter_image_delay: config.worker.inter_image_delay(),
            retry_policy: policy,
        },
    );

    let worker_id = format!(
        "{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string()),
        Uuid::new_v4()
    );
    info!(worker_id = %worker_id, "Worker identity assigned");

    // Wake-up plumbing: both the SQS bridge and the intake endpoint poke
    // the same Notify; the claim loop treats it as "check the store now".
    let notify = Arc::new(Notify::new());

    if let Some(ref url) = config.queue.job_queue_url {
        info!(url = %url, "Connecting to wake-up queue...");
        let queue_config = QueueConfig {
            url: url.clone(),
            dlq_url: config.queue.dlq_url.clone(),
            visibility_timeout: config.queue.visibility_timeout_secs as i32,
            wait_time_seconds: config.queue.poll_timeout_secs as i32,
            max_messages: config.queue.batch_size as i32,
        };
        let queue = Arc::new(Queue::new(queue_config).await?);
        tokio::spawn(queue_bridge(queue, notify.clone()));
    } else {
        info!("No wake-up queue configured, relying on store polling");
    }

    if config.worker.webhook_port != 0 {
        let webhook_notify = notify.clone();
        let port = config.worker.webhook_port;
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(port, webhook_notify).await {
                error!(error = %e, "Intake endpoint failed");
            }
        });
    }

    info!("Worker ready, starting claim loop...");

    // Circuit breaker state
    let mut consecutive_failures = 0;
    const MAX_FAILURES: u32 = 5;
    const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);

    loop {
        // Circuit breaker check
        if consecutive_failures >= MAX_FAILURES {
            warn!(
                failures = consecutive_failures,
                "Circuit breaker open, pausing..."
            );
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            consecutive_failures = 0;
            info!("Circuit breaker reset, resuming...");
        }

        // Recover abandoned claims before every claim cycle
        match store.reclaim_stale_locks(config.worker.lock_timeout()).await {
            Ok(reclaimed) => {
                if reclaimed > 0 {
                    warn!(reclaimed, "Reclaimed stale job locks");
                }
                metrics::record_stale_locks(reclaimed);
            }
            Err(e) => {
                error!(error = %e, "Failed to reclaim stale locks");
                consecutive_failures += 1;
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        }

        match store.claim_next(&worker_id).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                match processor.process_job(job).await {
                    Ok(outcome) => {
                        consecutive_failures = 0;
                        tracing::debug!(job_id = %job_id, outcome = ?outcome, "Job processed");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            job_id = %job_id,
                            error = %e,
                            failures = consecutive_failures,
                            "Failed to process job"
                        );
                        // The claim stays on the row; the stale-lock reclaim
                        // returns it to the pool after the timeout.
                    }
                }
            }
            Ok(None) => {
                // Nothing eligible: sleep until the poll interval elapses or
                // a wake-up arrives, whichever is first.
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(config.worker.poll_interval()) => {}
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(error = %e, "Failed to claim job");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    info!("Worker shutting down");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.observability.log_level));

    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Forward queue messages into claim-loop wake-ups.
/// Messages are deleted on receipt: a wake-up needs no redelivery, the
/// store poll covers any loss.
async fn queue_bridge(queue: Arc<Queue>, notify: Arc<Notify>) {
    loop {
        match queue.receive::<JobAvailableMessage>().await {
            Ok(messages) => {
                metrics::record_queue_depth(messages.len());
                for (message, receipt) in &messages {
                    tracing::debug!(
                        batch_id = %message.batch_id,
                        job_count = message.job_ids.len(),
                        "Wake-up message received"
                    );
                    if let Err(e) = queue.delete(receipt).await {
                        error!(error = %e, "Failed to delete wake-up message");
                    }
                }
                if !messages.is_empty() {
                    notify.notify_one();
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to receive wake-up messages");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
