use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use backfill_service::{
    config::AppConfig,
    engine::{BackfillEngine, DeviceRef, RetryPolicy},
    metrics_server, observability,
    sinks::PostgresStatisticsStore,
    sources::{CloudEnergySource, RateLimiter, StaticTokenProvider},
};
use futures::StreamExt;
use sqlx::postgres::PgPoolOptions;
use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

type Engine = BackfillEngine<CloudEnergySource<StaticTokenProvider>, PostgresStatisticsStore>;

struct BackfillJob {
    device: DeviceRef,
    depth_days: u16,
}

#[derive(Clone)]
struct AppState {
    jobs: mpsc::Sender<BackfillJob>,
    /// Advisory single-flight lock per device; concurrent plans against a
    /// moving extent would race on read_extent.
    active: Arc<Mutex<HashSet<String>>>,
    default_depth_days: u16,
}

#[derive(Debug, serde::Deserialize)]
struct BackfillRequest {
    device_id: String,
    installation_id: String,
    room_id: String,
    depth_days: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr);
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
    let engine: Arc<Engine> = Arc::new(BackfillEngine::new(
        source,
        store,
        retry,
        cfg.reporting_offset(),
    ));

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<BackfillJob>(cfg.service.job_queue_capacity);
    let active: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    // Job worker: backfills for different devices run concurrently; the
    // shared rate limiter keeps the combined request rate within bounds.
    let worker = {
        let engine = engine.clone();
        let active = active.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ReceiverStream::new(rx)
                .for_each_concurrent(None, |job| {
                    let engine = engine.clone();
                    let active = active.clone();
                    let cancel = cancel.clone();
                    async move {
                        let report = engine.run(&job.device, job.depth_days, &cancel).await;
                        match &report.error {
                            None => tracing::info!(
                                series = %report.series,
                                planned = report.windows_planned,
                                committed = report.windows_committed,
                                points = report.points_committed,
                                "backfill finished"
                            ),
                            Some(e) => tracing::error!(
                                series = %report.series,
                                planned = report.windows_planned,
                                committed = report.windows_committed,
                                error = %e,
                                "backfill aborted"
                            ),
                        }
                        active
                            .lock()
                            .expect("active device set lock poisoned")
                            .remove(&job.device.device_id);
                    }
                })
                .await;
        })
    };

    let state = AppState {
        jobs: tx,
        active,
        default_depth_days: cfg.backfill.default_depth_days,
    };
    let app = Router::new()
        .route("/backfill", post(request_backfill))
        .with_state(state);

    let addr: SocketAddr = cfg
        .service
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid service.bind_addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "backfill service listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested, stopping between windows");
                cancel.cancel();
            }
        })
        .await?;

    // Server dropped its job sender; the worker drains in-flight jobs.
    worker.await?;

    Ok(())
}

async fn request_backfill(
    State(state): State<AppState>,
    Json(req): Json<BackfillRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let depth_days = req.depth_days.unwrap_or(state.default_depth_days);
    if !(1..=365).contains(&depth_days) {
        return Err((
            StatusCode::BAD_REQUEST,
            "depth_days must be within 1..=365".to_string(),
        ));
    }

    {
        let mut active = state.active.lock().expect("active device set lock poisoned");
        if !active.insert(req.device_id.clone()) {
            return Err((
                StatusCode::CONFLICT,
                format!("backfill already running for {}", req.device_id),
            ));
        }
    }

    let job = BackfillJob {
        device: DeviceRef {
            device_id: req.device_id.clone(),
            installation_id: req.installation_id,
            room_id: req.room_id,
        },
        depth_days,
    };
    if state.jobs.send(job).await.is_err() {
        state
            .active
            .lock()
            .expect("active device set lock poisoned")
            .remove(&req.device_id);
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "job queue closed".to_string(),
        ));
    }

    Ok(Json(serde_json::json!({
        "accepted": true,
        "device_id": req.device_id,
        "depth_days": depth_days,
    })))
}
