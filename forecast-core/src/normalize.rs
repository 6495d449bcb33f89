//! Projects provider series onto a shared fixed-cadence axis.
//!
//! Every grid timestamp takes the nearest raw sample within the tolerance
//! window, or stays empty. Nothing is interpolated, and both providers go
//! through the same policy.

use chrono::{DateTime, Duration, Utc};

use crate::model::{AlignedSeries, ForecastAxis, ForecastPoint, ForecastSeries};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid alignment policy: {0}")]
pub struct InvalidPolicy(String);

/// Grid cadence, matching tolerance and forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPolicy {
    cadence: Duration,
    tolerance: Duration,
    horizon: Duration,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self {
            cadence: Duration::hours(3),
            tolerance: Duration::minutes(90),
            horizon: Duration::days(5),
        }
    }
}

impl AlignmentPolicy {
    pub fn new(
        cadence: Duration,
        tolerance: Duration,
        horizon: Duration,
    ) -> Result<Self, InvalidPolicy> {
        if cadence.num_seconds() <= 0 || Duration::days(1).num_seconds() % cadence.num_seconds() != 0
        {
            return Err(InvalidPolicy(format!(
                "cadence of {}min does not evenly divide a day",
                cadence.num_minutes()
            )));
        }
        if tolerance < Duration::zero() || tolerance >= cadence {
            return Err(InvalidPolicy(format!(
                "tolerance of {}min must be non-negative and below the cadence",
                tolerance.num_minutes()
            )));
        }
        if horizon < cadence {
            return Err(InvalidPolicy("horizon is shorter than one cadence step".into()));
        }
        Ok(Self { cadence, tolerance, horizon })
    }

    pub fn grid_len(&self) -> usize {
        (self.horizon.num_seconds() / self.cadence.num_seconds()) as usize
    }

    /// The grid starting at the first cadence boundary (counted from UTC
    /// midnight) at or after `now`.
    pub fn build_axis(&self, now: DateTime<Utc>) -> ForecastAxis {
        let step = self.cadence.num_seconds();
        let ts = now.timestamp();
        let mut start = ts.div_euclid(step) * step;
        if start < ts || (start == ts && now.timestamp_subsec_nanos() > 0) {
            start += step;
        }

        let timestamps = (0..self.grid_len() as i64)
            .filter_map(|i| DateTime::from_timestamp(start + i * step, 0))
            .collect();
        ForecastAxis::new(timestamps)
    }

    /// Align one series onto `axis`.
    pub fn align(&self, series: &ForecastSeries, axis: &ForecastAxis) -> AlignedSeries {
        let points = series.points();
        if points.is_empty() {
            return AlignedSeries::all_missing(series.provider(), axis.len());
        }
        let slots = axis
            .timestamps()
            .iter()
            .map(|t| nearest_within(points, *t, self.tolerance).cloned())
            .collect();

        AlignedSeries { provider: series.provider(), slots }
    }
}

/// Closest sample to `target` with `|Δ| <= tolerance`; ties go to the
/// earlier sample. `points` must be sorted by timestamp.
fn nearest_within(
    points: &[ForecastPoint],
    target: DateTime<Utc>,
    tolerance: Duration,
) -> Option<&ForecastPoint> {
    let idx = points.partition_point(|p| p.timestamp < target);

    let before = idx.checked_sub(1).and_then(|i| points.get(i));
    let after = points.get(idx);

    let distance = |p: &ForecastPoint| (p.timestamp - target).abs();

    let best = match (before, after) {
        (Some(b), Some(a)) => {
            if distance(a) < distance(b) {
                a
            } else {
                b
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    (distance(best) <= tolerance).then_some(best)
}
