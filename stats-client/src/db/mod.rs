mod statistics_queries;

pub use statistics_queries::{insert_points, load_series, series_extent, StatsDbError};
