//! Per-day digests of an aligned series, in the configured local timezone.

use chrono::{NaiveDate, TimeZone};

use crate::model::{AlignedSeries, ForecastAxis};

const COMPASS_POINTS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
    "NNW",
];

/// 16-point compass name for a wind direction; `?` when unknown.
pub fn compass(deg: Option<f64>) -> &'static str {
    match deg.filter(|d| d.is_finite()) {
        Some(d) => {
            let ix = ((d.rem_euclid(360.0) + 11.25) / 22.5) as usize % 16;
            COMPASS_POINTS[ix]
        }
        None => "?",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaySummary {
    pub temp_min: f64,
    pub temp_max: f64,
    pub precipitation_mm: f64,
    pub wind_mean_ms: f64,
    pub wind_dir_deg: Option<f64>,
}

/// Summaries for each local date in `days`, `None` where the series has no
/// sample on that date.
pub fn summarize<Tz: TimeZone>(
    series: &AlignedSeries,
    axis: &ForecastAxis,
    tz: &Tz,
    days: &[NaiveDate],
) -> Vec<Option<DaySummary>> {
    days.iter()
        .map(|day| {
            let points: Vec<_> = axis
                .timestamps()
                .iter()
                .zip(&series.slots)
                .filter(|(t, _)| t.with_timezone(tz).date_naive() == *day)
                .filter_map(|(_, slot)| slot.as_ref())
                .collect();

            if points.is_empty() {
                return None;
            }

            let temps = points.iter().map(|p| p.temperature_c);
            let temp_min = temps.clone().fold(f64::INFINITY, f64::min);
            let temp_max = temps.fold(f64::NEG_INFINITY, f64::max);
            let precipitation_mm = points.iter().map(|p| p.precipitation_mm).sum();
            let wind_mean_ms =
                points.iter().map(|p| p.wind_speed_ms).sum::<f64>() / points.len() as f64;

            // Middle reported direction, not a vector mean.
            let dirs: Vec<f64> = points.iter().filter_map(|p| p.wind_dir_deg).collect();
            let wind_dir_deg = dirs.get(dirs.len() / 2).copied();

            Some(DaySummary {
                temp_min,
                temp_max,
                precipitation_mm,
                wind_mean_ms,
                wind_dir_deg,
            })
        })
        .collect()
}

/// Distinct local dates covered by the axis, in order.
pub fn local_days<Tz: TimeZone>(axis: &ForecastAxis, tz: &Tz) -> Vec<NaiveDate> {
    let mut days: Vec<NaiveDate> = Vec::new();
    for t in axis.timestamps() {
        let day = t.with_timezone(tz).date_naive();
        if days.last() != Some(&day) {
            days.push(day);
        }
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ForecastPoint;
    use crate::provider::ProviderId;
    use chrono::{DateTime, Utc};

    #[test]
    fn compass_covers_boundaries() {
        assert_eq!(compass(Some(0.0)), "N");
        assert_eq!(compass(Some(11.24)), "N");
        assert_eq!(compass(Some(11.25)), "NNE");
        assert_eq!(compass(Some(90.0)), "E");
        assert_eq!(compass(Some(225.0)), "SW");
        assert_eq!(compass(Some(350.0)), "N");
        assert_eq!(compass(None), "?");
    }

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn point(t: DateTime<Utc>, temp: f64, dir: Option<f64>) -> ForecastPoint {
        ForecastPoint {
            timestamp: t,
            temperature_c: temp,
            precipitation_mm: 0.5,
            wind_speed_ms: 2.0,
            wind_dir_deg: dir,
            cloud_pct: None,
        }
    }

    #[test]
    fn summarizes_by_local_date() {
        let tz = chrono_tz::Europe::Moscow;
        // 21:00 UTC is already the next day in Moscow (UTC+3).
        let axis = ForecastAxis::new(vec![ts(1, 12), ts(1, 15), ts(1, 21)]);
        let series = AlignedSeries {
            provider: ProviderId::MetNo,
            slots: vec![
                Some(point(ts(1, 12), -1.0, Some(90.0))),
                Some(point(ts(1, 15), 4.0, Some(180.0))),
                Some(point(ts(1, 21), 9.0, None)),
            ],
        };

        let days = local_days(&axis, &tz);
        assert_eq!(days.len(), 2);

        let summaries = summarize(&series, &axis, &tz, &days);
        let first = summaries[0].as_ref().expect("data on first day");
        assert_eq!(first.temp_min, -1.0);
        assert_eq!(first.temp_max, 4.0);
        assert_eq!(first.precipitation_mm, 1.0);
        assert_eq!(first.wind_dir_deg, Some(180.0));

        let second = summaries[1].as_ref().expect("data on second day");
        assert_eq!(second.temp_min, 9.0);
        assert_eq!(second.wind_dir_deg, None);
    }

    #[test]
    fn day_without_samples_has_no_summary() {
        let tz = chrono_tz::UTC;
        let axis = ForecastAxis::new(vec![ts(1, 12), ts(2, 12)]);
        let series = AlignedSeries {
            provider: ProviderId::OpenWeather,
            slots: vec![None, Some(point(ts(2, 12), 3.0, None))],
        };

        let summaries = summarize(&series, &axis, &tz, &local_days(&axis, &tz));
        assert!(summaries[0].is_none());
        assert!(summaries[1].is_some());
    }
}
