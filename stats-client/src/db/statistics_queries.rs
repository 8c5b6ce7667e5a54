use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{SeriesExtent, SeriesId, StatisticPoint};

// Expected table:
//
//   CREATE TABLE statistic_points (
//       series_id    TEXT NOT NULL,
//       bucket_start TIMESTAMPTZ NOT NULL,
//       sum          DOUBLE PRECISION NOT NULL,
//       state        DOUBLE PRECISION,
//       UNIQUE (series_id, bucket_start)
//   );

#[derive(thiserror::Error, Debug)]
pub enum StatsDbError {
    /// The unique (series_id, bucket_start) constraint was violated.
    #[error("duplicate bucket_start for series {series}: {detail}")]
    DuplicateBucket { series: String, detail: String },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct ExtentRow {
    earliest_bucket: Option<OffsetDateTime>,
    latest_bucket: Option<OffsetDateTime>,
}

/// Read the coverage of a series: earliest/latest bucket and the cumulative
/// sum of the most recent point.
pub async fn series_extent(pool: &PgPool, series: &SeriesId) -> Result<SeriesExtent> {
    let extent = sqlx::query_as::<_, ExtentRow>(
        r#"
        SELECT
            MIN(bucket_start) AS earliest_bucket,
            MAX(bucket_start) AS latest_bucket
        FROM statistic_points
        WHERE series_id = $1
        "#,
    )
    .bind(series.as_str())
    .fetch_one(pool)
    .await?;

    let last_sum: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT sum
        FROM statistic_points
        WHERE series_id = $1
        ORDER BY bucket_start DESC
        LIMIT 1
        "#,
    )
    .bind(series.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(SeriesExtent {
        earliest_bucket: extent.earliest_bucket,
        latest_bucket: extent.latest_bucket,
        last_sum,
    })
}

/// Fetch a time-ordered slice of a series, e.g. for dashboard rendering.
pub async fn load_series(
    pool: &PgPool,
    series: &SeriesId,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<StatisticPoint>> {
    let rows = sqlx::query_as::<_, StatisticPoint>(
        r#"
        SELECT
            bucket_start,
            sum,
            state
        FROM statistic_points
        WHERE series_id = $1
          AND bucket_start >= $2
          AND bucket_start <  $3
        ORDER BY bucket_start
        "#,
    )
    .bind(series.as_str())
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Append statistics points for a series.
///
/// Collisions on (series_id, bucket_start) surface as `DuplicateBucket`
/// rather than being silently upserted; committed points are never rewritten.
pub async fn insert_points(
    pool: &PgPool,
    series: &SeriesId,
    points: &[StatisticPoint],
) -> Result<(), StatsDbError> {
    if points.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO statistic_points (series_id, bucket_start, sum, state) ",
    );

    builder.push_values(points, |mut b, p| {
        b.push_bind(series.as_str())
            .push_bind(p.bucket_start)
            .push_bind(p.sum)
            .push_bind(p.state);
    });

    let query = builder.build();
    match query.execute(pool).await {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
            Err(StatsDbError::DuplicateBucket {
                series: series.as_str().to_string(),
                detail: db.message().to_string(),
            })
        }
        Err(e) => Err(StatsDbError::Db(e)),
    }
}
