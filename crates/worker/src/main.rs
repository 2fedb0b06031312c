//! Resumely Background Worker
//!
//! Handles scheduled jobs including:
//! - Reprocessing abandoned Pending webhook events (every minute)
//! - Billing invariant checks and the dead-letter digest (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use anyhow::Context;
use resumely_billing::{
    alerts::sink_from_config, AlertSink, BillingConfig, BillingService, InvariantChecker,
    ReconcileOutcome, ReprocessResult,
};
use resumely_shared::create_pool;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Events re-run per reprocessing pass
const REPROCESS_BATCH: i64 = 100;

/// Log results of a reprocessing pass
fn log_reprocess_results(results: &[ReprocessResult]) {
    let applied = results
        .iter()
        .filter(|r| matches!(r.outcome, Some(ReconcileOutcome::Applied { .. })))
        .count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r.outcome, Some(ReconcileOutcome::Rejected { .. })))
        .count();
    let errors = results.iter().filter(|r| r.error.is_some()).count();

    info!(
        total = results.len(),
        applied = applied,
        rejected = rejected,
        errors = errors,
        "Webhook reprocessing pass complete"
    );

    for result in results {
        if let Some(e) = &result.error {
            error!(
                event_id = %result.event_id,
                event_type = %result.event_type,
                error = %e,
                "Reprocessing failed; event stays pending"
            );
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,resumely_worker=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting Resumely Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;

    let config = BillingConfig::from_env().context("billing configuration invalid")?;
    let billing = Arc::new(BillingService::from_config(&config, pool.clone()));
    let alerts: Arc<dyn AlertSink> = sink_from_config(config.slack_webhook_url.as_deref());
    let checker = Arc::new(InvariantChecker::new(pool));

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Re-run Pending events whose claim was released or abandoned (every minute)
    // A pass still running when the next tick fires is not overlapped
    let reprocess_billing = billing.clone();
    let reprocess_guard = Arc::new(Mutex::new(()));
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = reprocess_billing.clone();
            let guard = reprocess_guard.clone();
            Box::pin(async move {
                let Ok(_running) = guard.try_lock() else {
                    warn!("Previous reprocessing pass still running; skipping");
                    return;
                };
                match billing.webhooks.reprocess_stale(REPROCESS_BATCH).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_reprocess_results(&results),
                    Err(e) => error!(error = %e, "Failed to list stale webhook events"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook reprocessing (every minute)");

    // Job 2: Invariant checks including the dead-letter digest (hourly)
    let invariant_checker = checker.clone();
    let invariant_alerts = alerts.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            let alerts = invariant_alerts.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let summary = match checker.run_all_checks().await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(error = %e, "Invariant checks failed to run");
                        return;
                    }
                };

                info!(
                    checks_run = summary.checks_run,
                    checks_failed = summary.checks_failed,
                    violations = summary.violations.len(),
                    healthy = summary.healthy,
                    "Invariant check complete"
                );

                for violation in &summary.violations {
                    warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        description = %violation.description,
                        "Billing invariant violated"
                    );
                    if let Err(e) = alerts.send(&violation.to_alert()).await {
                        error!(invariant = %violation.invariant, error = %e, "Failed to send invariant alert");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks and dead-letter digest (hourly)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Resumely Worker started successfully with {} scheduled jobs", 3);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
