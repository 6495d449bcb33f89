use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{ProviderError, ProviderId};

/// Telegram-style chat identifier.
pub type ChatId = i64;
/// Telegram-style user identifier.
pub type UserId = i64;

/// Geographic point the bot forecasts for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub place_name: String,
}

impl Coordinate {
    /// Build a coordinate, rejecting non-finite or out-of-range values.
    pub fn new(
        latitude: f64,
        longitude: f64,
        place_name: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let coordinate = Self { latitude, longitude, place_name: place_name.into() };
        coordinate.validate()?;
        Ok(coordinate)
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ProviderError::InvalidCoordinate(format!(
                "latitude {} is outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ProviderError::InvalidCoordinate(format!(
                "longitude {} is outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }

    /// Name used in captions and chart titles.
    pub fn display_name(&self) -> &str {
        let name = self.place_name.trim();
        if name.is_empty() { "unknown" } else { name }
    }
}

/// One forecast sample in common units.
///
/// Precipitation is the amount expected over the following three hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub precipitation_mm: f64,
    pub wind_speed_ms: f64,
    pub wind_dir_deg: Option<f64>,
    pub cloud_pct: Option<f64>,
}

/// Provider-tagged samples with strictly increasing timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSeries {
    provider: ProviderId,
    points: Vec<ForecastPoint>,
}

impl ForecastSeries {
    /// Wraps `points` as they were received. Out-of-order or duplicate
    /// timestamps are a provider contract violation and are not repaired.
    pub fn new(provider: ProviderId, points: Vec<ForecastPoint>) -> Result<Self, ProviderError> {
        if let Some(pair) = points.windows(2).find(|w| w[0].timestamp >= w[1].timestamp) {
            return Err(ProviderError::SchemaMismatch {
                provider,
                detail: format!(
                    "timestamps not strictly increasing ({} then {})",
                    pair[0].timestamp, pair[1].timestamp
                ),
            });
        }
        Ok(Self { provider, points })
    }

    pub fn empty(provider: ProviderId) -> Self {
        Self { provider, points: Vec::new() }
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn points(&self) -> &[ForecastPoint] {
        &self.points
    }
}

/// Shared timestamp axis both providers are aligned onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastAxis {
    timestamps: Vec<DateTime<Utc>>,
}

impl ForecastAxis {
    pub fn new(timestamps: Vec<DateTime<Utc>>) -> Self {
        Self { timestamps }
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// A provider's series projected onto an axis: one slot per axis timestamp,
/// `None` where the provider had nothing within tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeries {
    pub provider: ProviderId,
    pub slots: Vec<Option<ForecastPoint>>,
}

impl AlignedSeries {
    pub fn all_missing(provider: ProviderId, len: usize) -> Self {
        Self { provider, slots: vec![None; len] }
    }

    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_all_missing(&self) -> bool {
        self.present_count() == 0
    }

    /// Temperatures in slot order, `None` for gaps.
    pub fn temperatures(&self) -> impl Iterator<Item = Option<f64>> + '_ {
        self.slots.iter().map(|s| s.as_ref().map(|p| p.temperature_c))
    }
}

/// Both providers aligned on one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub axis: ForecastAxis,
    pub model_a: AlignedSeries,
    pub model_b: AlignedSeries,
}

impl Comparison {
    pub fn series(&self) -> [&AlignedSeries; 2] {
        [&self.model_a, &self.model_b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(hour: u32) -> ForecastPoint {
        ForecastPoint {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap(),
            temperature_c: 1.0,
            precipitation_mm: 0.0,
            wind_speed_ms: 2.0,
            wind_dir_deg: None,
            cloud_pct: None,
        }
    }

    #[test]
    fn coordinate_rejects_out_of_range_values() {
        assert!(Coordinate::new(91.0, 0.0, "x").is_err());
        assert!(Coordinate::new(0.0, -180.5, "x").is_err());
        assert!(Coordinate::new(f64::NAN, 0.0, "x").is_err());

        let ok = Coordinate::new(55.75, 37.62, "Moscow").expect("valid coordinate");
        assert_eq!(ok.display_name(), "Moscow");
    }

    #[test]
    fn blank_place_name_displays_as_unknown() {
        let c = Coordinate::new(0.0, 0.0, "  ").unwrap();
        assert_eq!(c.display_name(), "unknown");
    }

    #[test]
    fn series_rejects_reordered_or_duplicate_timestamps() {
        let err = ForecastSeries::new(ProviderId::MetNo, vec![point(3), point(0)]).unwrap_err();
        assert!(matches!(err, ProviderError::SchemaMismatch { .. }));

        let err = ForecastSeries::new(ProviderId::MetNo, vec![point(3), point(3)]).unwrap_err();
        assert!(matches!(err, ProviderError::SchemaMismatch { .. }));
    }

    #[test]
    fn series_keeps_gaps() {
        let series =
            ForecastSeries::new(ProviderId::OpenWeather, vec![point(0), point(9)]).unwrap();
        assert_eq!(series.points().len(), 2);
        assert_eq!(series.provider(), ProviderId::OpenWeather);
    }
}
