// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NITP Background Worker
//!
//! Handles scheduled jobs including:
//! - Membership expiry sweep (hourly)
//! - Stale pending transaction reconciliation (every 15 minutes)
//! - Billing invariant checks (daily at 3:00 AM UTC)

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use nitp_billing::{BillingService, InvariantChecker};
use nitp_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nitp_worker=debug")),
        )
        .init();

    info!("Starting NITP Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let stale_after =
        jobs::stale_pending_threshold(std::env::var("STALE_PENDING_MINUTES").ok().as_deref())?;

    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    let checker = InvariantChecker::new(pool);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire memberships whose last period has ended (hourly)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running membership expiry sweep");
                jobs::expire_lapsed_members(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Membership expiry sweep (hourly)");

    // Job 2: Re-verify Pending transactions nobody came back for (every 15 minutes)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running stale pending reconciliation");
                jobs::reconcile_stale_pending(&billing, stale_after).await;
            })
        })?)
        .await?;
    info!(
        stale_after_minutes = stale_after.whole_minutes(),
        "Scheduled: Stale pending reconciliation (every 15 minutes)"
    );

    // Job 3: Billing invariant checks (daily at 3:00 AM UTC)
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                jobs::run_invariant_checks(&checker).await;
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily 3:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("NITP Worker started successfully with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let mut scheduler = scheduler;
    scheduler.shutdown().await?;

    Ok(())
}
