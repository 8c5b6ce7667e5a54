use time::OffsetDateTime;

/// External statistic identifier in the destination store.
///
/// Historical imports always write under a dedicated `_imported` id so they
/// can never collide with the series the live polling loop appends to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId(String);

impl SeriesId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The historical-import series for a device.
    pub fn imported(device_id: &str) -> Self {
        Self(format!("{device_id}_imported"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One committed entry in a statistics series. Append-only once written.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StatisticPoint {
    /// Start of the hour-aligned destination bucket.
    pub bucket_start: OffsetDateTime,
    /// Cumulative total; non-decreasing within a series.
    pub sum: f64,
    /// Energy delta for the period covered by this point.
    pub state: Option<f64>,
}

/// Known coverage of a series, read from the destination before planning.
///
/// All fields `None` means the series has never been written to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesExtent {
    pub earliest_bucket: Option<OffsetDateTime>,
    pub latest_bucket: Option<OffsetDateTime>,
    pub last_sum: Option<f64>,
}

impl SeriesExtent {
    pub fn is_empty(&self) -> bool {
        self.earliest_bucket.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imported_series_id_carries_suffix() {
        let id = SeriesId::imported("tft-0a1b");
        assert_eq!(id.as_str(), "tft-0a1b_imported");
    }

    #[test]
    fn empty_extent_has_no_earliest_bucket() {
        assert!(SeriesExtent::default().is_empty());

        let extent = SeriesExtent {
            earliest_bucket: Some(time::macros::datetime!(2024-03-01 00:00:00 UTC)),
            latest_bucket: Some(time::macros::datetime!(2024-03-02 00:00:00 UTC)),
            last_sum: Some(12.5),
        };
        assert!(!extent.is_empty());
    }
}
