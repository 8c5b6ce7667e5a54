use stats_client::domain::SeriesExtent;
use time::{Duration, OffsetDateTime, UtcOffset};

use super::policy::{self, Granularity, FINE_MAX_AGE, MEDIUM_MAX_AGE};

/// One remote query to execute: the half-open range `[start, end)` at a
/// single granularity tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub granularity: Granularity,
}

impl FetchWindow {
    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

/// Compute the fetch windows needed to extend a series' coverage to
/// `depth_days` of history, without re-deriving anything the destination
/// already holds.
///
/// The requested range is `[now_bucket - depth_days, target_end)` where
/// `target_end` is the earliest known bucket (the plan butts exactly against
/// existing coverage) or, for an empty series, the start of the current hour
/// (the still-accumulating bucket belongs to the live polling loop). An
/// already-covered range yields an empty plan.
///
/// Windows are returned newest-first and are executed in that order: if the
/// run fails partway, the committed prefix forms one unbroken interval
/// adjoining the prior extent. Window cuts are aligned to the bucket rule of
/// the older side so no destination bucket ever spans two windows.
pub fn plan(
    now: OffsetDateTime,
    depth_days: u16,
    extent: &SeriesExtent,
    tz: UtcOffset,
) -> Vec<FetchWindow> {
    let now_bucket = policy::bucket_align(now, Granularity::Fine, tz);
    let target_end = match extent.earliest_bucket {
        Some(earliest) => earliest.min(now_bucket),
        None => now_bucket,
    };
    let range_start = now_bucket - Duration::days(i64::from(depth_days));
    if target_end <= range_start {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut end = target_end;
    while end > range_start {
        let granularity = policy::granularity_for(now_bucket - end);
        let tier_floor = match granularity {
            Granularity::Fine => now_bucket - FINE_MAX_AGE,
            Granularity::Medium => now_bucket - MEDIUM_MAX_AGE,
            Granularity::Coarse => range_start,
        };
        let mut start = range_start
            .max(tier_floor)
            .max(end - granularity.max_window_span());
        if start > range_start {
            // The cut becomes the next (older, coarser-or-equal) window's
            // end; align it to that tier's bucket rule so its buckets close
            // exactly at the cut.
            let older = policy::granularity_for(now_bucket - start);
            start = policy::bucket_align(start, older, tz).max(range_start);
        }
        windows.push(FetchWindow { start, end, granularity });
        end = start;
    }
    windows
}
