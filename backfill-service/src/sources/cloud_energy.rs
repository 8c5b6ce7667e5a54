use std::time::Duration;

use reqwest::StatusCode;
use stats_client::domain::EnergySample;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::engine::{DeviceRef, EnergySource, FetchWindow, Granularity, SourceError};

use super::{RateLimiter, TokenProvider};

/// Fetches per-room energy metrics from the vendor cloud API.
///
/// One GET per fetch window, paced by the shared `RateLimiter`. The client
/// performs no aggregation and no persistence; it only maps wire records into
/// `EnergySample`s.
pub struct CloudEnergySource<T> {
    http: reqwest::Client,
    base_url: String,
    subscription_key: String,
    tokens: T,
    limiter: RateLimiter,
}

/// Wire shape of one metric record.
#[derive(Debug, serde::Deserialize)]
struct RawEnergyMetric {
    #[serde(rename = "startDateOfMetric")]
    start_date_of_metric: Option<String>,
    /// Watt-hours consumed during the metric's period.
    #[serde(default)]
    sum: f64,
}

fn remote_period(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Fine => "Hour",
        Granularity::Medium => "Day",
        Granularity::Coarse => "Month",
    }
}

/// Translate wire records into samples, ascending by timestamp.
///
/// Records without a parsable start date are dropped with a warning; the
/// remote occasionally emits placeholder rows for periods with no data.
fn map_records(records: Vec<RawEnergyMetric>, granularity: Granularity) -> Vec<EnergySample> {
    let mut samples = Vec::with_capacity(records.len());
    for record in records {
        let Some(raw_ts) = record.start_date_of_metric else {
            tracing::warn!("energy metric without startDateOfMetric, skipping");
            metrics::counter!("cloud_energy_unparsable_records_total").increment(1);
            continue;
        };
        let ts = match OffsetDateTime::parse(&raw_ts, &Rfc3339) {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(raw = %raw_ts, error = %e, "unparsable metric timestamp, skipping");
                metrics::counter!("cloud_energy_unparsable_records_total").increment(1);
                continue;
            }
        };
        samples.push(EnergySample {
            ts,
            value_wh: record.sum,
            period: granularity.period(),
            cumulative: false,
        });
    }
    samples.sort_by_key(|s| s.ts);
    samples
}

impl<T> CloudEnergySource<T> {
    pub fn new(
        base_url: impl Into<String>,
        subscription_key: impl Into<String>,
        timeout: Duration,
        tokens: T,
        limiter: RateLimiter,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            subscription_key: subscription_key.into(),
            tokens,
            limiter,
        })
    }
}

#[async_trait::async_trait]
impl<T> EnergySource for CloudEnergySource<T>
where
    T: TokenProvider,
{
    async fn fetch(
        &self,
        device: &DeviceRef,
        window: &FetchWindow,
    ) -> Result<Vec<EnergySample>, SourceError> {
        let _permit = self.limiter.acquire().await;
        let token = self.tokens.bearer_token().await?;

        let url = format!(
            "{}/energymodule/v1/installations/{}/rooms/{}/metrics",
            self.base_url, device.installation_id, device.room_id
        );
        let from = window
            .start
            .format(&Rfc3339)
            .map_err(|e| SourceError::RemoteUnavailable(format!("bad window start: {e}")))?;
        let to = window
            .end
            .format(&Rfc3339)
            .map_err(|e| SourceError::RemoteUnavailable(format!("bad window end: {e}")))?;

        metrics::counter!("cloud_energy_requests_total").increment(1);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header("ocp-apim-subscription-key", &self.subscription_key)
            .query(&[
                ("period", remote_period(window.granularity)),
                ("from", from.as_str()),
                ("to", to.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::RemoteUnavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let records: Vec<RawEnergyMetric> = response
                    .json()
                    .await
                    .map_err(|e| SourceError::RemoteUnavailable(format!("bad response body: {e}")))?;
                Ok(map_records(records, window.granularity))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::warn!(device = %device.device_id, "remote rejected credentials");
                Err(SourceError::AuthExpired)
            }
            status => {
                metrics::counter!("cloud_energy_failed_requests_total").increment(1);
                Err(SourceError::RemoteUnavailable(format!(
                    "unexpected status {status}"
                )))
            }
        }
    }
}
