pub mod merge;
pub mod planner;
pub mod policy;

pub use merge::{merge_window, MergeOutcome};
pub use planner::{plan, FetchWindow};
pub use policy::{bucket_align, granularity_for, Granularity};

use std::time::Duration;

use stats_client::domain::{EnergySample, SeriesExtent, SeriesId, StatisticPoint};
use time::{OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

/// Device plus the installation context its energy history is queried under.
#[derive(Debug, Clone)]
pub struct DeviceRef {
    pub device_id: String,
    pub installation_id: String,
    pub room_id: String,
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("remote source unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("authentication expired")]
    AuthExpired,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A committed bucket_start was written a second time. Under correct
    /// planning this cannot happen; it is an internal-consistency failure.
    #[error("bucket collision: {detail}")]
    WriteConflict { detail: String },
    #[error("statistics store unavailable: {0}")]
    Unavailable(String),
}

#[derive(thiserror::Error, Debug)]
pub enum BackfillError {
    #[error("remote source unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("authentication expired")]
    AuthExpired,
    #[error("bucket collision committing window {start} .. {end}: {detail}")]
    WriteConflict {
        start: OffsetDateTime,
        end: OffsetDateTime,
        detail: String,
    },
    #[error("statistics store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("backfill cancelled")]
    Cancelled,
}

/// Fetches samples for one window from the remote source. Implementations
/// perform no aggregation and no persistence.
#[async_trait::async_trait]
pub trait EnergySource: Send + Sync {
    /// Samples for `window`, ascending by timestamp. One remote request per
    /// window; windows are never batched.
    async fn fetch(
        &self,
        device: &DeviceRef,
        window: &FetchWindow,
    ) -> Result<Vec<EnergySample>, SourceError>;
}

/// Append/query access to the destination statistics store.
#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn read_extent(&self, series: &SeriesId) -> Result<SeriesExtent, StoreError>;
    async fn append_points(
        &self,
        series: &SeriesId,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per window on `RemoteUnavailable`, beyond the first attempt.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Outcome of one backfill invocation. A zero-window plan is a success: the
/// requested depth is already covered.
#[derive(Debug)]
pub struct BackfillReport {
    pub series: SeriesId,
    pub windows_planned: usize,
    pub windows_committed: usize,
    pub points_committed: usize,
    pub error: Option<BackfillError>,
}

impl BackfillReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives one device's historical import: read the series extent, plan the
/// missing range, then fetch, merge and commit window by window.
///
/// Windows execute strictly sequentially, newest first, and each window is
/// committed before the next fetch starts, so a failure partway leaves a
/// consistent, gap-free stretch of history adjoining the prior coverage.
pub struct BackfillEngine<S, K> {
    source: S,
    store: K,
    retry: RetryPolicy,
    tz: UtcOffset,
}

impl<S, K> BackfillEngine<S, K>
where
    S: EnergySource,
    K: StatisticsStore,
{
    pub fn new(source: S, store: K, retry: RetryPolicy, tz: UtcOffset) -> Self {
        Self {
            source,
            store,
            retry,
            tz,
        }
    }

    pub async fn run(
        &self,
        device: &DeviceRef,
        depth_days: u16,
        cancel: &CancellationToken,
    ) -> BackfillReport {
        let series = SeriesId::imported(&device.device_id);

        let extent = match self.store.read_extent(&series).await {
            Ok(extent) => extent,
            Err(e) => {
                return BackfillReport {
                    series,
                    windows_planned: 0,
                    windows_committed: 0,
                    points_committed: 0,
                    error: Some(BackfillError::StoreUnavailable(e.to_string())),
                }
            }
        };

        let now = OffsetDateTime::now_utc();
        let windows = planner::plan(now, depth_days, &extent, self.tz);
        if windows.is_empty() {
            tracing::info!(series = %series, depth_days, "requested depth already covered");
            return BackfillReport {
                series,
                windows_planned: 0,
                windows_committed: 0,
                points_committed: 0,
                error: None,
            };
        }
        tracing::info!(
            series = %series,
            windows = windows.len(),
            depth_days,
            "planned historical import"
        );

        let mut running_sum = extent.last_sum.unwrap_or(0.0);
        let mut windows_committed = 0;
        let mut points_committed = 0;
        let mut error = None;

        for window in &windows {
            if cancel.is_cancelled() {
                error = Some(BackfillError::Cancelled);
                break;
            }

            let samples = match self.fetch_with_retry(device, window).await {
                Ok(samples) => samples,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };

            let outcome = merge::merge_window(&samples, window, self.tz, running_sum);
            if let Err(e) = self.store.append_points(&series, &outcome.points).await {
                error = Some(match e {
                    StoreError::WriteConflict { detail } => {
                        tracing::error!(
                            series = %series,
                            window_start = %window.start,
                            window_end = %window.end,
                            granularity = ?window.granularity,
                            detail = %detail,
                            "bucket collision while committing, aborting plan"
                        );
                        BackfillError::WriteConflict {
                            start: window.start,
                            end: window.end,
                            detail,
                        }
                    }
                    StoreError::Unavailable(detail) => BackfillError::StoreUnavailable(detail),
                });
                break;
            }

            running_sum = outcome.running_sum;
            windows_committed += 1;
            points_committed += outcome.points.len();
            metrics::counter!("backfill_windows_committed_total").increment(1);
            metrics::counter!("backfill_points_committed_total")
                .increment(outcome.points.len() as u64);
            tracing::debug!(
                series = %series,
                window_start = %window.start,
                window_end = %window.end,
                points = outcome.points.len(),
                "window committed"
            );
        }

        BackfillReport {
            series,
            windows_planned: windows.len(),
            windows_committed,
            points_committed,
            error,
        }
    }

    async fn fetch_with_retry(
        &self,
        device: &DeviceRef,
        window: &FetchWindow,
    ) -> Result<Vec<EnergySample>, BackfillError> {
        let mut attempt: u32 = 0;
        loop {
            match self.source.fetch(device, window).await {
                Ok(samples) => return Ok(samples),
                Err(SourceError::AuthExpired) => return Err(BackfillError::AuthExpired),
                Err(SourceError::RemoteUnavailable(detail)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry.backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        error = %detail,
                        attempt,
                        "window fetch failed, retrying with backoff"
                    );
                    metrics::counter!("backfill_fetch_retries_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(SourceError::RemoteUnavailable(detail)) => {
                    tracing::error!(error = %detail, "window fetch failed, giving up");
                    return Err(BackfillError::RemoteUnavailable(detail));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn device() -> DeviceRef {
        DeviceRef {
            device_id: "dev-1".to_string(),
            installation_id: "inst-1".to_string(),
            room_id: "room-1".to_string(),
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            backoff: Duration::from_millis(1),
        }
    }

    /// Returns one sample at each window's start; fails with
    /// `RemoteUnavailable` on the configured call indexes (0-based, counting
    /// every fetch attempt), or always with `AuthExpired`.
    #[derive(Default)]
    struct ScriptedSource {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        fail_always: bool,
        fail_auth: bool,
    }

    impl ScriptedSource {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl EnergySource for ScriptedSource {
        async fn fetch(
            &self,
            _device: &DeviceRef,
            window: &FetchWindow,
        ) -> Result<Vec<EnergySample>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_auth {
                return Err(SourceError::AuthExpired);
            }
            if self.fail_always || self.fail_on.contains(&call) {
                return Err(SourceError::RemoteUnavailable("scripted outage".to_string()));
            }
            Ok(vec![EnergySample {
                ts: window.start,
                value_wh: 5.0,
                period: window.granularity.period(),
                cumulative: false,
            }])
        }
    }

    /// In-memory store that rejects duplicate buckets like the real sink.
    #[derive(Default)]
    struct MemoryStore {
        points: Mutex<BTreeMap<(String, OffsetDateTime), StatisticPoint>>,
        append_log: Mutex<Vec<StatisticPoint>>,
        appends: AtomicUsize,
    }

    impl MemoryStore {
        fn committed(&self) -> Vec<StatisticPoint> {
            self.append_log.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl StatisticsStore for MemoryStore {
        async fn read_extent(&self, series: &SeriesId) -> Result<SeriesExtent, StoreError> {
            let points = self.points.lock().unwrap();
            let mut series_points = points
                .iter()
                .filter(|((series_key, _), _)| series_key.as_str() == series.as_str())
                .map(|(_, p)| p);
            let first = series_points.next();
            let last = series_points.last().or(first);
            Ok(SeriesExtent {
                earliest_bucket: first.map(|p| p.bucket_start),
                latest_bucket: last.map(|p| p.bucket_start),
                last_sum: last.map(|p| p.sum),
            })
        }

        async fn append_points(
            &self,
            series: &SeriesId,
            new_points: &[StatisticPoint],
        ) -> Result<(), StoreError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            let mut points = self.points.lock().unwrap();
            for p in new_points {
                let key = (series.as_str().to_string(), p.bucket_start);
                if points.contains_key(&key) {
                    return Err(StoreError::WriteConflict {
                        detail: format!("bucket {} already present", p.bucket_start),
                    });
                }
            }
            for p in new_points {
                points.insert((series.as_str().to_string(), p.bucket_start), p.clone());
            }
            self.append_log.lock().unwrap().extend_from_slice(new_points);
            Ok(())
        }
    }

    /// Delegates to a `MemoryStore` but fails a chosen append call.
    struct FailingStore {
        inner: MemoryStore,
        fail_on: usize,
        error: fn() -> StoreError,
    }

    #[async_trait::async_trait]
    impl StatisticsStore for FailingStore {
        async fn read_extent(&self, series: &SeriesId) -> Result<SeriesExtent, StoreError> {
            self.inner.read_extent(series).await
        }

        async fn append_points(
            &self,
            series: &SeriesId,
            points: &[StatisticPoint],
        ) -> Result<(), StoreError> {
            if self.inner.appends.load(Ordering::SeqCst) == self.fail_on {
                self.inner.appends.fetch_add(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            self.inner.append_points(series, points).await
        }
    }

    #[tokio::test]
    async fn third_window_failure_keeps_two_committed_and_aborts() {
        // Depth 80 plans four windows (fine + three medium chunks).
        let engine = BackfillEngine::new(
            ScriptedSource {
                fail_on: vec![2],
                ..Default::default()
            },
            MemoryStore::default(),
            no_retry(),
            UtcOffset::UTC,
        );

        let report = engine.run(&device(), 80, &CancellationToken::new()).await;

        assert_eq!(report.windows_planned, 4);
        assert_eq!(report.windows_committed, 2);
        assert!(matches!(report.error, Some(BackfillError::RemoteUnavailable(_))));
        assert_eq!(engine.source.calls(), 3);
        assert_eq!(engine.store.committed().len(), 2);
    }

    #[tokio::test]
    async fn second_run_after_full_success_plans_nothing() {
        let engine = BackfillEngine::new(
            ScriptedSource::default(),
            MemoryStore::default(),
            no_retry(),
            UtcOffset::UTC,
        );

        let first = engine.run(&device(), 10, &CancellationToken::new()).await;
        assert!(first.is_complete());
        assert!(first.windows_planned > 0);
        assert_eq!(first.windows_committed, first.windows_planned);

        let second = engine.run(&device(), 10, &CancellationToken::new()).await;
        assert!(second.is_complete());
        assert_eq!(second.windows_planned, 0);
        assert_eq!(second.windows_committed, 0);
    }

    #[tokio::test]
    async fn auth_expiry_is_not_retried() {
        let engine = BackfillEngine::new(
            ScriptedSource {
                fail_auth: true,
                ..Default::default()
            },
            MemoryStore::default(),
            RetryPolicy {
                max_retries: 3,
                backoff: Duration::from_millis(1),
            },
            UtcOffset::UTC,
        );

        let report = engine.run(&device(), 10, &CancellationToken::new()).await;

        assert!(matches!(report.error, Some(BackfillError::AuthExpired)));
        assert_eq!(report.windows_committed, 0);
        assert_eq!(engine.source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_outage_is_retried_a_bounded_number_of_times() {
        let engine = BackfillEngine::new(
            ScriptedSource {
                fail_always: true,
                ..Default::default()
            },
            MemoryStore::default(),
            RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(100),
            },
            UtcOffset::UTC,
        );

        let report = engine.run(&device(), 3, &CancellationToken::new()).await;

        assert!(matches!(report.error, Some(BackfillError::RemoteUnavailable(_))));
        // One attempt plus two retries for the first window, then abort.
        assert_eq!(engine.source.calls(), 3);
        assert_eq!(report.windows_committed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_outage_recovers_on_retry() {
        let engine = BackfillEngine::new(
            ScriptedSource {
                fail_on: vec![0],
                ..Default::default()
            },
            MemoryStore::default(),
            RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(100),
            },
            UtcOffset::UTC,
        );

        let report = engine.run(&device(), 3, &CancellationToken::new()).await;

        assert!(report.is_complete());
        assert_eq!(report.windows_committed, report.windows_planned);
        assert_eq!(engine.source.calls(), report.windows_planned + 1);
    }

    #[tokio::test]
    async fn bucket_collision_aborts_without_touching_later_windows() {
        let engine = BackfillEngine::new(
            ScriptedSource::default(),
            FailingStore {
                inner: MemoryStore::default(),
                fail_on: 1,
                error: || StoreError::WriteConflict {
                    detail: "duplicate bucket".to_string(),
                },
            },
            no_retry(),
            UtcOffset::UTC,
        );

        let report = engine.run(&device(), 80, &CancellationToken::new()).await;

        assert_eq!(report.windows_committed, 1);
        assert!(matches!(report.error, Some(BackfillError::WriteConflict { .. })));
        // The second fetch happened, the third and fourth never started.
        assert_eq!(engine.source.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_windows() {
        let engine = BackfillEngine::new(
            ScriptedSource::default(),
            MemoryStore::default(),
            no_retry(),
            UtcOffset::UTC,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine.run(&device(), 10, &cancel).await;

        assert!(matches!(report.error, Some(BackfillError::Cancelled)));
        assert!(report.windows_planned > 0);
        assert_eq!(report.windows_committed, 0);
        assert_eq!(engine.source.calls(), 0);
    }

    #[tokio::test]
    async fn committed_sums_continue_from_the_existing_series() {
        let store = MemoryStore::default();
        let series = SeriesId::imported("dev-1");
        let seeded_bucket =
            policy::bucket_align(OffsetDateTime::now_utc() - time::Duration::days(5), Granularity::Medium, UtcOffset::UTC);
        store
            .append_points(
                &series,
                &[StatisticPoint {
                    bucket_start: seeded_bucket,
                    sum: 42.0,
                    state: Some(42.0),
                }],
            )
            .await
            .expect("seed append");

        let engine = BackfillEngine::new(ScriptedSource::default(), store, no_retry(), UtcOffset::UTC);
        let report = engine.run(&device(), 30, &CancellationToken::new()).await;

        assert!(report.is_complete());
        assert!(report.windows_committed > 0);
        let committed = engine.store.committed();
        // Skip the seed point; every imported point extends the existing sum.
        for point in committed.iter().skip(1) {
            assert!(point.sum >= 42.0);
        }
        assert_eq!(committed[1].sum, 47.0);
    }

    #[tokio::test]
    async fn sums_never_decrease_across_a_run_in_commit_order() {
        let engine = BackfillEngine::new(
            ScriptedSource::default(),
            MemoryStore::default(),
            no_retry(),
            UtcOffset::UTC,
        );

        let report = engine.run(&device(), 120, &CancellationToken::new()).await;
        assert!(report.is_complete());

        let committed = engine.store.committed();
        assert_eq!(committed.len(), report.points_committed);
        for pair in committed.windows(2) {
            assert!(pair[1].sum >= pair[0].sum);
        }
    }
}
