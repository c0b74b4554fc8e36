//! Missive notification worker.
//!
//! Main entry point. Loads configuration, connects the queue backend, the
//! delivery ledger and the email provider, then runs the worker loop until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use missive_core::{Clock, RealClock};
use missive_queue::{InMemoryQueue, QueueClient, RedisQueue, SqsQueue};
use missive_worker::{
    DedupeProvider, DeliveryLedger, HandlerRegistry, InMemoryLedger, JobProcessor, LogFormat,
    QueueProvider, RedisLedger, WorkerConfig, WorkerEngine, WorkerLoop,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::load()?;
    init_tracing(&config)?;

    info!("Starting missive notification worker");
    info!(
        queue_provider = ?config.queue_provider,
        email_provider = ?config.email_provider,
        dedupe_provider = ?config.dedupe_provider,
        redis_url = %config.redis_url_masked(),
        sendgrid_api_key_set = config.sendgrid_api_key.is_some(),
        batch_size = config.batch_size(),
        concurrency = config.concurrency(),
        max_retries = config.max_retries,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let queue = create_queue(&config, clock.clone()).await?;
    info!(backend = queue.backend_name(), "Queue backend connected");

    let ledger = create_ledger(&config, clock.clone()).await?;

    let dispatcher = missive_mail::build_dispatcher(&config.to_provider_config())
        .await
        .context("Failed to create email dispatcher")?;

    let handlers = HandlerRegistry::with_builtin(config.email_from.clone());
    let job_types: Vec<&str> = handlers.job_types().map(|job_type| job_type.as_str()).collect();
    info!(job_types = ?job_types, "Job handlers registered");

    let processor = JobProcessor::new(
        handlers,
        dispatcher,
        ledger,
        config.to_retry_policy(),
    );
    let worker = WorkerLoop::new(queue, processor, config.to_loop_config(), clock);
    let stats = worker.stats();

    let mut engine = WorkerEngine::new(worker);
    engine.start()?;
    info!("Missive is ready to deliver notifications");

    shutdown_signal().await;
    info!("Shutdown signal received, draining current batch");

    let shutdown = engine.shutdown().await;

    let stats = stats.read().await.clone();
    info!(
        cycles = stats.cycles,
        jobs_processed = stats.jobs_processed,
        delivered = stats.delivered,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        duplicates = stats.duplicates,
        "Final worker statistics"
    );

    shutdown.context("Worker did not shut down cleanly")?;
    info!("Missive shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over `LOG_LEVEL` when set.
fn init_tracing(config: &WorkerConfig) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid RUST_LOG or LOG_LEVEL")?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Connects the configured queue backend.
async fn create_queue(
    config: &WorkerConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn QueueClient>> {
    let queue: Arc<dyn QueueClient> = match config.queue_provider {
        QueueProvider::Sqs => {
            let sqs_config = config
                .to_sqs_config()
                .context("SQS_PRIORITY_QUEUE_URL and SQS_REGULAR_QUEUE_URL are required")?;
            let mut loader = aws_config::from_env();
            if let Some(region) = &config.aws_region {
                loader = loader.region(aws_config::Region::new(region.clone()));
            }
            let sdk_config = loader.load().await;
            if sqs_config.dead_letter_url.is_none() {
                warn!("No SQS dead-letter queue configured, dead letters are only logged");
            }
            Arc::new(SqsQueue::new(&sdk_config, sqs_config))
        },
        QueueProvider::Redis => Arc::new(
            RedisQueue::connect(
                &config.redis_url,
                config.redis_queue_prefix.clone(),
                config.visibility_timeout(),
                clock,
            )
            .await
            .context("Failed to connect redis queue")?,
        ),
        QueueProvider::Memory => {
            warn!("Using in-memory queue, jobs are lost on exit");
            Arc::new(InMemoryQueue::with_visibility_timeout(clock, config.visibility_timeout()))
        },
    };
    Ok(queue)
}

/// Creates the delivery ledger. Claims live as long as a receipt.
async fn create_ledger(
    config: &WorkerConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn DeliveryLedger>> {
    let ledger: Arc<dyn DeliveryLedger> = match config.dedupe_provider {
        DedupeProvider::Redis => Arc::new(
            RedisLedger::connect(
                &config.redis_url,
                config.redis_queue_prefix.clone(),
                config.dedupe_ttl(),
                config.visibility_timeout(),
            )
            .await
            .context("Failed to connect redis delivery ledger")?,
        ),
        DedupeProvider::Memory => Arc::new(InMemoryLedger::new(
            clock,
            config.dedupe_ttl(),
            config.visibility_timeout(),
        )),
    };
    Ok(ledger)
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
