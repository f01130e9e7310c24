//! Summary statistics shared by the connection and pressure phases

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `100 * part / total`, defined as 0 when `total` is 0
pub fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Duration samples collected during a phase
#[derive(Debug, Default, Clone)]
pub struct DurationStats {
    pub samples: Vec<Duration>,
}

impl DurationStats {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Calculate percentile (0-100), nearest-rank on the sorted samples
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort();

        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Serializable view, all values in milliseconds
    pub fn summary(&self) -> DurationSummary {
        let ms = |d: Option<Duration>| d.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0);
        DurationSummary {
            count: self.samples.len(),
            min_ms: ms(self.min()),
            avg_ms: ms(self.mean()),
            max_ms: ms(self.max()),
            p50_ms: ms(self.percentile(50.0)),
            p95_ms: ms(self.percentile(95.0)),
            p99_ms: ms(self.percentile(99.0)),
        }
    }
}

/// Distribution of a duration sample set; zeros when no samples exist
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DurationSummary {
    pub count: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}
