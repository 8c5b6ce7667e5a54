use anyhow::{bail, Result};
use backfill_service::{
    config::AppConfig,
    engine::{BackfillEngine, DeviceRef, RetryPolicy},
    observability,
    sinks::PostgresStatisticsStore,
    sources::{CloudEnergySource, RateLimiter, StaticTokenProvider},
};
use sqlx::postgres::PgPoolOptions;
use std::{env, time::Duration};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        bail!("usage: backfill_device <device_id> <installation_id> <room_id> [depth_days]");
    }
    let device = DeviceRef {
        device_id: args[1].clone(),
        installation_id: args[2].clone(),
        room_id: args[3].clone(),
    };

    // Load configuration (can point BACKFILL_CONFIG to a one-off file).
    let cfg = AppConfig::load()?;

    let depth_days: u16 = match args.get(4) {
        Some(raw) => raw.parse()?,
        None => cfg.backfill.default_depth_days,
    };
    if !(1..=365).contains(&depth_days) {
        bail!("depth_days must be within 1..=365");
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.store.max_connections)
        .connect(&cfg.store.uri)
        .await?;
    let store = PostgresStatisticsStore::new(pool);

    let limiter = RateLimiter::new(
        cfg.remote.max_in_flight,
        Duration::from_millis(cfg.remote.min_request_interval_ms),
    );
    let tokens = StaticTokenProvider::new(cfg.remote.bearer_token.clone());
    let source = CloudEnergySource::new(
        cfg.remote.base_url.clone(),
        cfg.remote.subscription_key.clone(),
        Duration::from_secs(cfg.remote.timeout_secs),
        tokens,
        limiter,
    )?;

    let retry = RetryPolicy {
        max_retries: cfg.remote.max_retries,
        backoff: Duration::from_millis(cfg.remote.retry_backoff_ms),
    };
    let engine = BackfillEngine::new(source, store, retry, cfg.reporting_offset());

    let report = engine
        .run(&device, depth_days, &CancellationToken::new())
        .await;

    tracing::info!(
        series = %report.series,
        planned = report.windows_planned,
        committed = report.windows_committed,
        points = report.points_committed,
        "backfill finished"
    );
    if let Some(e) = report.error {
        bail!(
            "backfill aborted after {} of {} windows: {e}",
            report.windows_committed,
            report.windows_planned
        );
    }

    Ok(())
}
