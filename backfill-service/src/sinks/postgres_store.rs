use sqlx::postgres::PgPool;
use stats_client::db::{self, StatsDbError};
use stats_client::domain::{SeriesExtent, SeriesId, StatisticPoint};

use crate::engine::{StatisticsStore, StoreError};

/// Destination statistics store backed by Postgres (or any pgwire-compatible
/// time-series database).
pub struct PostgresStatisticsStore {
    pool: PgPool,
}

impl PostgresStatisticsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StatisticsStore for PostgresStatisticsStore {
    async fn read_extent(&self, series: &SeriesId) -> Result<SeriesExtent, StoreError> {
        db::series_extent(&self.pool, series)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn append_points(
        &self,
        series: &SeriesId,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        match db::insert_points(&self.pool, series, points).await {
            Ok(()) => {
                metrics::counter!("statistics_points_written_total")
                    .increment(points.len() as u64);
                Ok(())
            }
            Err(StatsDbError::DuplicateBucket { series, detail }) => {
                Err(StoreError::WriteConflict {
                    detail: format!("series {series}: {detail}"),
                })
            }
            Err(StatsDbError::Db(e)) => Err(StoreError::Unavailable(e.to_string())),
        }
    }
}
