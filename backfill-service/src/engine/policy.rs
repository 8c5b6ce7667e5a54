use stats_client::domain::PeriodKind;
use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// Sampling resolution tier for a stretch of history.
///
/// Recent ranges are fetched and stored at full fidelity; the further back a
/// range lies, the coarser the tier, bounding both request volume against the
/// remote source and storage volume in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    /// Hourly resolution.
    Fine,
    /// Daily resolution.
    Medium,
    /// Monthly resolution.
    Coarse,
}

/// Ages younger than this are fetched hourly.
pub const FINE_MAX_AGE: Duration = Duration::days(7);
/// Ages younger than this (and at least `FINE_MAX_AGE`) are fetched daily.
pub const MEDIUM_MAX_AGE: Duration = Duration::days(90);

impl Granularity {
    pub fn period(self) -> PeriodKind {
        match self {
            Granularity::Fine => PeriodKind::Hourly,
            Granularity::Medium => PeriodKind::Daily,
            Granularity::Coarse => PeriodKind::Monthly,
        }
    }

    /// The longest range a single fetch request may cover at this tier.
    pub fn max_window_span(self) -> Duration {
        match self {
            Granularity::Fine => Duration::days(7),
            Granularity::Medium => Duration::days(30),
            Granularity::Coarse => Duration::days(365),
        }
    }
}

/// Tier for data whose age relative to "now" is `age`.
pub fn granularity_for(age: Duration) -> Granularity {
    if age < FINE_MAX_AGE {
        Granularity::Fine
    } else if age < MEDIUM_MAX_AGE {
        Granularity::Medium
    } else {
        Granularity::Coarse
    }
}

/// Start of the bucket containing `instant` at the given tier.
///
/// Fine buckets start on the hour; medium buckets at local midnight of the
/// containing day; coarse buckets at local midnight of the first day of the
/// containing month. "Local" is the reporting timezone of the installation.
pub fn bucket_align(instant: OffsetDateTime, granularity: Granularity, tz: UtcOffset) -> OffsetDateTime {
    let local = instant.to_offset(tz);
    match granularity {
        Granularity::Fine => local.replace_time(
            Time::from_hms(local.hour(), 0, 0).unwrap_or(Time::MIDNIGHT),
        ),
        Granularity::Medium => local.replace_time(Time::MIDNIGHT),
        Granularity::Coarse => local
            .replace_day(1)
            .unwrap_or(local)
            .replace_time(Time::MIDNIGHT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn tier_boundaries_sit_at_seven_and_ninety_days() {
        assert_eq!(granularity_for(Duration::ZERO), Granularity::Fine);
        assert_eq!(granularity_for(Duration::days(7) - Duration::seconds(1)), Granularity::Fine);
        assert_eq!(granularity_for(Duration::days(7)), Granularity::Medium);
        assert_eq!(granularity_for(Duration::days(90) - Duration::seconds(1)), Granularity::Medium);
        assert_eq!(granularity_for(Duration::days(90)), Granularity::Coarse);
        assert_eq!(granularity_for(Duration::days(365)), Granularity::Coarse);
    }

    #[test]
    fn tier_never_gets_finer_with_age() {
        let mut previous = Granularity::Fine;
        for days in 0..=400 {
            let tier = granularity_for(Duration::days(days));
            assert!(tier >= previous, "tier got finer at age {days}d");
            previous = tier;
        }
    }

    #[test]
    fn fine_aligns_to_start_of_hour() {
        let aligned = bucket_align(datetime!(2024-06-15 12:34:56 UTC), Granularity::Fine, UtcOffset::UTC);
        assert_eq!(aligned, datetime!(2024-06-15 12:00:00 UTC));
    }

    #[test]
    fn medium_aligns_to_local_midnight() {
        // 01:30 UTC is 03:30 local; the containing local day starts at
        // midnight local, which is 22:00 UTC the previous day.
        let aligned = bucket_align(datetime!(2024-06-15 01:30:00 UTC), Granularity::Medium, offset!(+2));
        assert_eq!(aligned, datetime!(2024-06-15 00:00:00 +2));
        assert_eq!(aligned, datetime!(2024-06-14 22:00:00 UTC));
    }

    #[test]
    fn coarse_aligns_to_first_of_month_local_midnight() {
        let aligned = bucket_align(datetime!(2024-06-15 13:00:00 UTC), Granularity::Coarse, offset!(+2));
        assert_eq!(aligned, datetime!(2024-06-01 00:00:00 +2));
    }

    #[test]
    fn granularity_maps_to_reporting_period() {
        assert_eq!(Granularity::Fine.period(), PeriodKind::Hourly);
        assert_eq!(Granularity::Medium.period(), PeriodKind::Daily);
        assert_eq!(Granularity::Coarse.period(), PeriodKind::Monthly);
    }
}
