mod classifier;
mod config;
mod engine;
mod executor;
mod workspace;


use codepad_common::connection;
use codepad_common::queue::{self, Claim};
use config::WorkerConfig;
use engine::DockerEngine;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Back-off after a broker error before trying to claim again
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything a slot needs, shared read-only across slots
struct WorkerContext {
    config: WorkerConfig,
    engine: DockerEngine,
}

fn init_tracing() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Codepad Worker booting...");

    let config = WorkerConfig::from_env().map_err(|e| {
        error!("Invalid worker configuration: {:#}", e);
        e
    })?;
    info!(config = %serde_json::to_string(&config)?, "Worker configured");

    let engine = DockerEngine::new(&config)?;
    engine.ping().await?;
    engine.ensure_image().await?;
    info!(image = %config.toolchain.image, "Sandbox ready");

    let conn = connection::shared(&config.broker).await?;

    let concurrency = config.concurrency;
    let ctx = Arc::new(WorkerContext { config, engine });
    let slots = Arc::new(Semaphore::new(concurrency));
    let reaper = tokio::spawn(reap_loop(ctx.clone(), conn.clone()));

    // Setup graceful shutdown
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler; running until killed");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, draining in-flight jobs...");
        let _ = stop.send(true);
    });

    dispatch_loop(ctx.clone(), conn, slots.clone(), shutdown).await?;

    reaper.abort();
    let _drained = slots.acquire_many(concurrency as u32).await?;

    info!("Worker shutdown complete");
    Ok(())
}

/// Claim one job per free slot and hand it to a slot task.
///
/// Claims are non-blocking so the shared multiplexed connection is never
/// parked on a blocking command; an empty queue backs off for the poll
/// interval instead. Shutdown is only observed between claims, so a claim
/// in flight always completes and its job is run.
#[instrument(skip_all, fields(worker = %ctx.config.worker_name, slots = ctx.config.concurrency))]
async fn dispatch_loop(
    ctx: Arc<WorkerContext>,
    mut conn: ConnectionManager,
    slots: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("Waiting for jobs");
    while let Some(permit) = next_slot(&slots, &mut shutdown).await? {
        match queue::claim_next(&mut conn, &ctx.config.worker_name, ctx.config.lease()).await {
            Ok(Some(claim)) => {
                let job = &claim.job;
                info!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    source_size = job.code.len(),
                    stdin_size = job.stdin.len(),
                    queued_ms = (chrono::Utc::now() - job.enqueued_at).num_milliseconds(),
                    "Received job"
                );

                let ctx = ctx.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    process_job(&ctx, conn, claim).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                idle(ctx.config.poll_interval(), &mut shutdown).await;
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "Broker error while claiming");
                idle(BROKER_RETRY_DELAY, &mut shutdown).await;
            }
        }
    }

    info!("Stopped claiming jobs");
    Ok(())
}

/// Wait for a free slot. `None` once shutdown has been requested.
async fn next_slot(
    slots: &Arc<Semaphore>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<Option<OwnedSemaphorePermit>> {
    if *shutdown.borrow() {
        return Ok(None);
    }
    tokio::select! {
        permit = slots.clone().acquire_owned() => {
            let permit = permit?;
            if *shutdown.borrow() {
                return Ok(None);
            }
            Ok(Some(permit))
        }
        Ok(()) = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => Ok(None),
    }
}

/// Back off for `delay`, returning early on shutdown.
async fn idle(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        Ok(_) = shutdown.wait_for(|stop| *stop) => {}
    }
}

/// Run one claimed job and publish its terminal state.
///
/// Only infrastructure faults fail the job. They are not retried: the
/// reason is stored verbatim for the caller and the operator.
async fn process_job(ctx: &WorkerContext, mut conn: ConnectionManager, claim: Claim) {
    let job_id = claim.job.id;
    let retention = ctx.config.broker.retention_secs;
    let start = Instant::now();

    let published = match executor::execute(&ctx.engine, &claim.job, ctx.config.limits.output_limit_bytes).await {
        Ok(outcome) => queue::complete(&mut conn, &claim, &outcome, retention).await,
        Err(e) => {
            let reason = format!("{:#}", e);
            error!(job_id = %job_id, error = %reason, "Sandbox fault, failing job");
            queue::fail(&mut conn, &claim, &reason, retention).await
        }
    };

    let execution_ms = start.elapsed().as_millis() as u64;
    match published {
        Ok(true) => info!(job_id = %job_id, execution_ms, "Result persisted"),
        Ok(false) => warn!(job_id = %job_id, execution_ms, "Result discarded; job was reclaimed"),
        Err(e) => error!(
            job_id = %job_id,
            error = %e,
            "Failed to persist result; job will be redelivered after its lease expires"
        ),
    }
}

/// Periodically return jobs abandoned by crashed workers to the queue.
/// The first pass runs immediately at start-up.
async fn reap_loop(ctx: Arc<WorkerContext>, mut conn: ConnectionManager) {
    let mut ticker = tokio::time::interval(ctx.config.reap_interval());
    loop {
        ticker.tick().await;
        match queue::requeue_stalled(&mut conn).await {
            Ok(0) => debug!("No stalled jobs"),
            Ok(requeued) => warn!(requeued, "Requeued stalled jobs"),
            Err(e) => warn!(error = %e, "Stalled-job sweep failed"),
        }
    }
}
