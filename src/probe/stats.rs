//! Batch aggregation: raw sample latencies in, one `ProbeBatch` out.

use chrono::{DateTime, Utc};

use crate::models::{ProbeBatch, NO_SAMPLE_MIN};

/// Raw outcome of one batch of samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Samples {
    /// Latencies of the samples that completed, in milliseconds, in send order.
    pub latencies: Vec<f64>,
    /// Samples that timed out or failed.
    pub lost: u32,
}

impl Samples {
    /// A batch where nothing came back.
    pub fn all_lost(total: u32) -> Self {
        Self {
            latencies: Vec::new(),
            lost: total,
        }
    }
}

/// Aggregate `samples` into a batch of `total` configured probes, stamped now.
pub fn aggregate(samples: &Samples, total: u32) -> ProbeBatch {
    aggregate_at(samples, total, Utc::now())
}

/// Aggregate with an explicit completion timestamp.
///
/// Statistics are computed over successful samples only. A batch with no
/// successes is still emitted: loss is 1.0, `min` holds [`NO_SAMPLE_MIN`] and
/// the remaining statistics are 0.
pub fn aggregate_at(samples: &Samples, total: u32, timestamp: DateTime<Utc>) -> ProbeBatch {
    let mut sorted: Vec<f64> = samples
        .latencies
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let received = sorted.len() as u32;
    // Samples that never completed count as lost even if the prober forgot them.
    let lost = samples.lost.max(total.saturating_sub(received));
    let loss = if total == 0 {
        1.0
    } else {
        (f64::from(lost) / f64::from(total)).clamp(0.0, 1.0)
    };

    if sorted.is_empty() {
        return ProbeBatch {
            min: NO_SAMPLE_MIN,
            max: 0.0,
            median: 0.0,
            mean: 0.0,
            stddev: 0.0,
            loss,
            num_probes: total,
            timestamp,
        };
    }

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    ProbeBatch {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        median: median(&sorted),
        mean,
        stddev: variance.sqrt(),
        loss,
        num_probes: total,
        timestamp,
    }
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
