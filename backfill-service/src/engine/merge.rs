use std::collections::BTreeMap;

use stats_client::domain::{EnergySample, StatisticPoint};
use time::{OffsetDateTime, UtcOffset};

use super::planner::FetchWindow;
use super::policy;

/// Result of folding one window's samples into statistics points.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Points ready to append, bucket_start strictly increasing.
    pub points: Vec<StatisticPoint>,
    /// Cumulative sum after the newest point, to thread into the next window.
    pub running_sum: f64,
    pub resets_clamped: u32,
    pub skipped_out_of_range: u32,
}

/// Fold raw samples into cumulative statistics points for one window.
///
/// Samples are grouped by the window granularity's bucket rule. Delta samples
/// are summed per bucket; cumulative samples are differenced against the
/// previous cumulative reading and the last reading per bucket wins. A bucket
/// whose delta comes out negative is a meter reset: the delta is clamped to
/// zero and the committed sum never decreases.
pub fn merge_window(
    samples: &[EnergySample],
    window: &FetchWindow,
    tz: UtcOffset,
    running_sum: f64,
) -> MergeOutcome {
    let mut in_range: Vec<&EnergySample> = Vec::with_capacity(samples.len());
    let mut skipped_out_of_range = 0u32;
    for sample in samples {
        if sample.ts >= window.start && sample.ts < window.end {
            in_range.push(sample);
        } else {
            skipped_out_of_range += 1;
        }
    }
    if skipped_out_of_range > 0 {
        tracing::debug!(
            skipped = skipped_out_of_range,
            window_start = %window.start,
            window_end = %window.end,
            "dropped samples outside the fetch window"
        );
    }
    in_range.sort_by_key(|s| s.ts);

    let mut deltas: BTreeMap<OffsetDateTime, f64> = BTreeMap::new();
    let mut last_cumulative: Option<f64> = None;
    for sample in in_range {
        let delta = if sample.cumulative {
            // First cumulative reading has no baseline and contributes nothing.
            let d = sample.value_wh - last_cumulative.unwrap_or(sample.value_wh);
            last_cumulative = Some(sample.value_wh);
            d
        } else {
            sample.value_wh
        };
        let bucket = policy::bucket_align(sample.ts, window.granularity, tz);
        *deltas.entry(bucket).or_insert(0.0) += delta;
    }

    let mut points = Vec::with_capacity(deltas.len());
    let mut sum = running_sum;
    let mut resets_clamped = 0u32;
    for (bucket_start, delta) in deltas {
        let delta = if delta < 0.0 {
            tracing::warn!(
                bucket_start = %bucket_start,
                delta_wh = delta,
                "negative bucket delta, treating as meter reset"
            );
            metrics::counter!("backfill_meter_resets_clamped_total").increment(1);
            resets_clamped += 1;
            0.0
        } else {
            delta
        };
        sum += delta;
        points.push(StatisticPoint {
            bucket_start,
            sum,
            state: Some(delta),
        });
    }

    MergeOutcome {
        points,
        running_sum: sum,
        resets_clamped,
        skipped_out_of_range,
    }
}
