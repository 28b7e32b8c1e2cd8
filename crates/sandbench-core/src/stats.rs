//! Summary statistics over repeated measurements.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Distribution summary of one sample set, in the samples' unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation
    pub std_dev: f64,
}

impl Summary {
    /// Summarize `samples`.
    ///
    /// # Errors
    /// Returns [`CoreError::EmptySampleSet`] when `samples` is empty.
    pub fn compute(samples: &[f64]) -> Result<Self> {
        if samples.is_empty() {
            return Err(CoreError::EmptySampleSet);
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

        Ok(Self {
            count: sorted.len(),
            mean,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            std_dev: variance.sqrt(),
        })
    }
}

/// Nearest-rank percentile of an ascending-sorted, non-empty slice.
///
/// The rank is `ceil(p/100 * n) - 1`, clamped into the slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

/// Fold one sample into a running average.
///
/// The first sample becomes the average; every later sample is averaged
/// with the previous value, so recent samples dominate.
pub fn running_average(current: Option<f64>, sample: f64) -> f64 {
    match current {
        None => sample,
        Some(avg) => (avg + sample) / 2.0,
    }
}
