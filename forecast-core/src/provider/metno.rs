use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, header::USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

use crate::{
    model::{Coordinate, ForecastPoint, ForecastSeries},
    provider::{ProviderError, ProviderId, fetch_json},
};

use super::ForecastProvider;

/// Model-A: MET Norway Locationforecast 2.0 (`compact` variant).
///
/// The service requires an identifying `User-Agent` and rejects anonymous
/// clients, so one must be supplied.
#[derive(Debug, Clone)]
pub struct MetNoProvider {
    user_agent: String,
    base_url: String,
    timeout: Duration,
    http: Client,
}

impl MetNoProvider {
    pub const DEFAULT_URL: &'static str =
        "https://api.met.no/weatherapi/locationforecast/2.0/compact";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            base_url: Self::DEFAULT_URL.to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
            http: Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct MnResponse {
    properties: MnProperties,
}

#[derive(Debug, Deserialize)]
struct MnProperties {
    timeseries: Vec<MnStep>,
}

#[derive(Debug, Deserialize)]
struct MnStep {
    time: DateTime<Utc>,
    data: MnData,
}

#[derive(Debug, Deserialize)]
struct MnData {
    instant: MnInstant,
    next_1_hours: Option<MnPeriod>,
    next_6_hours: Option<MnPeriod>,
}

#[derive(Debug, Deserialize)]
struct MnInstant {
    details: MnInstantDetails,
}

#[derive(Debug, Deserialize)]
struct MnInstantDetails {
    air_temperature: Option<f64>,
    wind_speed: Option<f64>,
    wind_from_direction: Option<f64>,
    cloud_area_fraction: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MnPeriod {
    details: Option<MnPeriodDetails>,
}

#[derive(Debug, Deserialize)]
struct MnPeriodDetails {
    precipitation_amount: Option<f64>,
}

impl MnPeriod {
    fn precipitation(&self) -> Option<f64> {
        self.details.as_ref()?.precipitation_amount
    }
}

impl MnData {
    /// Precipitation over the next three hours. Hourly steps carry a 1 h
    /// amount, the coarser tail of the series only a 6 h amount.
    fn precipitation_3h(&self) -> Option<f64> {
        if let Some(mm) = self.next_1_hours.as_ref().and_then(MnPeriod::precipitation) {
            return Some(mm * 3.0);
        }
        self.next_6_hours.as_ref().and_then(MnPeriod::precipitation).map(|mm| mm / 2.0)
    }
}

/// Samples missing a required value are dropped rather than zero-filled.
fn to_point(step: &MnStep) -> Option<ForecastPoint> {
    let details = &step.data.instant.details;
    let temperature_c = details.air_temperature.filter(|t| t.is_finite())?;
    let wind_speed_ms = details.wind_speed.filter(|w| w.is_finite() && *w >= 0.0)?;
    let precipitation_mm = step.data.precipitation_3h().filter(|p| *p >= 0.0)?;

    Some(ForecastPoint {
        timestamp: step.time,
        temperature_c,
        precipitation_mm,
        wind_speed_ms,
        wind_dir_deg: details
            .wind_from_direction
            .filter(|d| d.is_finite())
            .map(|d| d.rem_euclid(360.0)),
        cloud_pct: details.cloud_area_fraction.filter(|c| (0.0..=100.0).contains(c)),
    })
}

#[async_trait]
impl ForecastProvider for MetNoProvider {
    fn id(&self) -> ProviderId {
        ProviderId::MetNo
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, coordinate: &Coordinate) -> Result<ForecastSeries, ProviderError> {
        coordinate.validate()?;

        // The API asks for at most four decimals; more defeats its cache.
        let lat = format!("{:.4}", coordinate.latitude);
        let lon = format!("{:.4}", coordinate.longitude);

        let request = self
            .http
            .get(&self.base_url)
            .header(USER_AGENT, self.user_agent.as_str())
            .query(&[("lat", lat.as_str()), ("lon", lon.as_str())]);

        let parsed: MnResponse = fetch_json(self.id(), request, self.timeout).await?;

        let points: Vec<ForecastPoint> =
            parsed.properties.timeseries.iter().filter_map(to_point).collect();

        tracing::debug!(
            provider = %self.id(),
            steps = parsed.properties.timeseries.len(),
            usable = points.len(),
            "parsed MET Norway timeseries"
        );

        ForecastSeries::new(self.id(), points)
    }
}
