use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    model::{Coordinate, ForecastPoint, ForecastSeries},
    provider::{ProviderError, ProviderId, fetch_json},
};

use super::ForecastProvider;

const KELVIN_OFFSET: f64 = 273.15;

/// Model-B: OpenWeather 5 day / 3 hour forecast.
///
/// Requested in the API's standard units (Kelvin, m/s); temperatures are
/// converted to Celsius while parsing.
#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    timeout: Duration,
    http: Client,
}

impl OpenWeatherProvider {
    pub const DEFAULT_URL: &'static str = "https://api.openweathermap.org/data/2.5/forecast";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
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
struct OwMain {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwClouds {
    all: Option<f64>,
}

/// Rain or snow volume; the key is omitted by the API when nothing falls.
#[derive(Debug, Deserialize)]
struct OwVolume {
    #[serde(rename = "3h")]
    three_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwForecastEntry {
    dt: i64,
    main: OwMain,
    wind: OwWind,
    clouds: Option<OwClouds>,
    rain: Option<OwVolume>,
    snow: Option<OwVolume>,
}

#[derive(Debug, Deserialize)]
struct OwForecastResponse {
    list: Vec<OwForecastEntry>,
}

fn volume(v: &Option<OwVolume>) -> f64 {
    v.as_ref().and_then(|v| v.three_hours).unwrap_or(0.0)
}

fn to_point(entry: &OwForecastEntry) -> Option<ForecastPoint> {
    let timestamp = DateTime::from_timestamp(entry.dt, 0)?;
    let temperature_c = Some(entry.main.temp - KELVIN_OFFSET).filter(|t| t.is_finite())?;
    let wind_speed_ms = Some(entry.wind.speed).filter(|w| w.is_finite() && *w >= 0.0)?;
    let precipitation_mm = volume(&entry.rain) + volume(&entry.snow);

    Some(ForecastPoint {
        timestamp,
        temperature_c,
        precipitation_mm: precipitation_mm.max(0.0),
        wind_speed_ms,
        wind_dir_deg: entry.wind.deg.filter(|d| d.is_finite()).map(|d| d.rem_euclid(360.0)),
        cloud_pct: entry
            .clouds
            .as_ref()
            .and_then(|c| c.all)
            .filter(|c| (0.0..=100.0).contains(c)),
    })
}

#[async_trait]
impl ForecastProvider for OpenWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, coordinate: &Coordinate) -> Result<ForecastSeries, ProviderError> {
        coordinate.validate()?;

        let lat = coordinate.latitude.to_string();
        let lon = coordinate.longitude.to_string();

        let request = self.http.get(&self.base_url).query(&[
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
            ("appid", self.api_key.as_str()),
        ]);

        let parsed: OwForecastResponse = fetch_json(self.id(), request, self.timeout).await?;

        let points: Vec<ForecastPoint> = parsed.list.iter().filter_map(to_point).collect();

        tracing::debug!(
            provider = %self.id(),
            entries = parsed.list.len(),
            usable = points.len(),
            "parsed OpenWeather forecast list"
        );

        ForecastSeries::new(self.id(), points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(json: serde_json::Value) -> OwForecastEntry {
        serde_json::from_value(json).expect("valid entry")
    }

    #[test]
    fn converts_kelvin_and_sums_rain_and_snow() {
        let e = entry(serde_json::json!({
            "dt": 1_772_366_400,
            "main": { "temp": 270.15 },
            "wind": { "speed": 3.5, "deg": 225 },
            "clouds": { "all": 75 },
            "rain": { "3h": 0.5 },
            "snow": { "3h": 1.25 }
        }));

        let p = to_point(&e).expect("usable");
        assert!((p.temperature_c + 3.0).abs() < 1e-9);
        assert_eq!(p.precipitation_mm, 1.75);
        assert_eq!(p.wind_dir_deg, Some(225.0));
        assert_eq!(p.cloud_pct, Some(75.0));
        assert_eq!(p.timestamp.timestamp(), 1_772_366_400);
    }

    #[test]
    fn absent_volumes_mean_dry_and_absent_direction_stays_missing() {
        let e = entry(serde_json::json!({
            "dt": 1_772_366_400,
            "main": { "temp": 283.15 },
            "wind": { "speed": 0.0 }
        }));

        let p = to_point(&e).expect("usable");
        assert_eq!(p.precipitation_mm, 0.0);
        assert_eq!(p.wind_dir_deg, None);
        assert_eq!(p.cloud_pct, None);
    }

    #[test]
    fn negative_wind_speed_is_not_usable() {
        let e = entry(serde_json::json!({
            "dt": 1_772_366_400,
            "main": { "temp": 283.15 },
            "wind": { "speed": -1.0 }
        }));

        assert!(to_point(&e).is_none());
    }
}
