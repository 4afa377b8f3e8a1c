//! PassGate Background Worker
//!
//! Handles scheduled jobs including:
//! - Profile access token and session cleanup (every 10 minutes)
//! - Reprovisioning of paid subscriptions the panel has not confirmed yet (every 5 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use passgate_api::auth::ProfileSessions;
use passgate_billing::{BillingConfig, BillingService};
use passgate_shared::{create_pool, PgStore, Store};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Subscriptions retried per sweep.
const REPROVISION_BATCH: i64 = 50;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting PassGate Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("DATABASE_MAX_CONNECTIONS has an invalid value: {raw}"))?,
        Err(_) => DEFAULT_MAX_CONNECTIONS,
    };
    let pool = create_pool(&database_url, max_connections).await?;
    info!("Database pool created");

    let config = BillingConfig::from_env()?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let billing = Arc::new(BillingService::new(store.clone(), &config)?);
    let profiles = ProfileSessions::new(store, config.app_base_url.clone());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Purge expired/consumed profile tokens and expired sessions
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let profiles = profiles.clone();
            Box::pin(async move {
                match profiles.cleanup_expired().await {
                    Ok(report) => info!(
                        deleted_tokens = report.deleted_tokens,
                        deleted_sessions = report.deleted_sessions,
                        "Profile cleanup complete"
                    ),
                    Err(e) => error!(error = %e, "Profile cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Profile cleanup (every 10 minutes)");

    // Job 2: Retry provisioning for paid subscriptions still pending on the panel
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing
                    .provisioning
                    .reprovision_pending(REPROVISION_BATCH)
                    .await
                {
                    Ok(report) if report.failed > 0 => warn!(
                        attempted = report.attempted,
                        provisioned = report.provisioned,
                        failed = report.failed,
                        "Reprovisioning sweep finished with failures"
                    ),
                    Ok(report) => info!(
                        attempted = report.attempted,
                        provisioned = report.provisioned,
                        "Reprovisioning sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Reprovisioning sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reprovisioning sweep (every 5 minutes)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("PassGate Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
