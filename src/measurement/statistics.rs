//! Aggregate display statistics over the anchors in range

use serde::{Deserialize, Serialize};

/// One anchor's latest measured distance and its surveyed distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceObservation {
    pub measured: f64,
    pub expected: f64,
}

/// Multi-anchor mean statistics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateStatistics {
    /// Mean measured distance (meters)
    pub mean_measured: f64,
    /// Mean surveyed distance (meters)
    pub mean_expected: f64,
    /// Mean |measured - expected| (meters)
    pub mean_absolute_error: f64,
    /// Mean |measured - expected| / expected, in percent
    pub mean_percentage_error: f64,
    /// Root mean square of the error (meters)
    pub rmse: f64,
    /// Largest absolute error (meters)
    pub max_error: f64,
    /// Number of observations in the statistics
    pub sample_count: usize,
}

impl AggregateStatistics {
    /// Compute statistics; observations with a non-positive expected
    /// distance are skipped.
    pub fn from_observations(observations: &[DistanceObservation]) -> Self {
        let usable: Vec<&DistanceObservation> = observations
            .iter()
            .filter(|o| o.expected > 0.0 && o.measured.is_finite())
            .collect();
        if usable.is_empty() {
            return Self::default();
        }

        let n = usable.len() as f64;
        let errors: Vec<f64> = usable.iter().map(|o| (o.measured - o.expected).abs()).collect();

        let mean_measured = usable.iter().map(|o| o.measured).sum::<f64>() / n;
        let mean_expected = usable.iter().map(|o| o.expected).sum::<f64>() / n;
        let mean_absolute_error = errors.iter().sum::<f64>() / n;
        let mean_percentage_error = usable
            .iter()
            .zip(&errors)
            .map(|(o, e)| e / o.expected * 100.0)
            .sum::<f64>()
            / n;
        let rmse = (errors.iter().map(|e| e.powi(2)).sum::<f64>() / n).sqrt();
        let max_error = errors.iter().copied().fold(0.0, f64::max);

        Self {
            mean_measured,
            mean_expected,
            mean_absolute_error,
            mean_percentage_error,
            rmse,
            max_error,
            sample_count: usable.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}
