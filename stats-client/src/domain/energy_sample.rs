use time::OffsetDateTime;

/// Reporting resolution of a single remote observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    Hourly,
    Daily,
    Monthly,
}

/// One raw energy observation fetched from the remote source.
///
/// `value_wh` is either the energy consumed during the sample's period or,
/// when `cumulative` is set, a running total since a device-defined epoch.
/// Samples are never mutated after fetching, only folded into statistics.
#[derive(Debug, Clone)]
pub struct EnergySample {
    pub ts: OffsetDateTime,
    pub value_wh: f64,
    pub period: PeriodKind,
    pub cumulative: bool,
}
