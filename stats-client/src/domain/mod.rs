mod energy_sample;
mod statistic_point;

pub use energy_sample::{EnergySample, PeriodKind};
pub use statistic_point::{SeriesExtent, SeriesId, StatisticPoint};
