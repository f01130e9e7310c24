use serde::{Deserialize, Serialize};
use thiserror::Error;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Memory monitoring errors. Both are soft: the run continues without
/// (further) memory data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("No process matching '{0}'")]
    ProcessNotFound(String),

    #[error("Process {0} is no longer running")]
    ProcessGone(u32),
}

/// One resident-memory reading of the observed process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemorySample {
    /// Seconds since the start of observation
    pub elapsed_seconds: f64,
    pub resident_bytes: u64,
}

/// Append-only sample sequence with strictly increasing timestamps, plus
/// the pre-load baseline when one was taken
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemorySeries {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    baseline: Option<u64>,
    samples: Vec<MemorySample>,
}

impl MemorySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Returns `false` and drops it if its timestamp does not
    /// move forward.
    pub fn record(&mut self, elapsed_seconds: f64, resident_bytes: u64) -> bool {
        if let Some(last) = self.samples.last()
            && elapsed_seconds <= last.elapsed_seconds
        {
            return false;
        }
        self.samples.push(MemorySample {
            elapsed_seconds,
            resident_bytes,
        });
        true
    }

    pub fn set_baseline(&mut self, resident_bytes: u64) {
        self.baseline = Some(resident_bytes);
    }

    pub fn baseline(&self) -> Option<u64> {
        self.baseline
    }

    pub fn samples(&self) -> &[MemorySample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Summary over the current samples; `None` until the first sample
    pub fn stats(&self) -> Option<MemoryStats> {
        MemoryStats::with_baseline(self.baseline, &self.samples)
    }

    pub fn to_csv(&self) -> String {
        samples_to_csv(&self.samples)
    }
}

/// `elapsed_seconds,resident_bytes` rows with a header line
pub fn samples_to_csv(samples: &[MemorySample]) -> String {
    let mut out = String::from("elapsed_seconds,resident_bytes\n");
    for sample in samples {
        out.push_str(&format!(
            "{:.3},{}\n",
            sample.elapsed_seconds, sample.resident_bytes
        ));
    }
    out
}

/// Derived view over a sample sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStats {
    pub sample_count: usize,
    /// Baseline average when one was taken, otherwise the first sample
    pub initial_bytes: u64,
    pub final_bytes: u64,
    pub peak_bytes: u64,
    pub average_bytes: f64,
    /// `final - initial`; negative when memory was released
    pub growth_bytes: i64,
}

impl MemoryStats {
    pub fn from_samples(samples: &[MemorySample]) -> Option<Self> {
        Self::with_baseline(None, samples)
    }

    /// Growth is measured from `baseline` when given
    pub fn with_baseline(baseline: Option<u64>, samples: &[MemorySample]) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;
        let initial = baseline.unwrap_or(first.resident_bytes);
        let peak = samples.iter().map(|s| s.resident_bytes).max()?;
        let total: f64 = samples.iter().map(|s| s.resident_bytes as f64).sum();

        Some(Self {
            sample_count: samples.len(),
            initial_bytes: initial,
            final_bytes: last.resident_bytes,
            peak_bytes: peak,
            average_bytes: total / samples.len() as f64,
            growth_bytes: last.resident_bytes as i64 - initial as i64,
        })
    }

    pub fn growth_mb(&self) -> f64 {
        self.growth_bytes as f64 / BYTES_PER_MIB
    }

    /// `|growth| / initial * 100`, 0 when the initial reading is 0
    pub fn growth_ratio_pct(&self) -> f64 {
        if self.initial_bytes == 0 {
            return 0.0;
        }
        self.growth_bytes.unsigned_abs() as f64 / self.initial_bytes as f64 * 100.0
    }

    pub fn verdict(&self, threshold_pct: f64) -> LeakVerdict {
        LeakVerdict::classify(self.growth_ratio_pct(), threshold_pct)
    }
}

/// Heuristic leak signal derived from the growth ratio. Not a proof.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeakVerdict {
    Normal,
    PossibleLeak,
}

impl LeakVerdict {
    pub fn classify(growth_ratio_pct: f64, threshold_pct: f64) -> Self {
        if growth_ratio_pct > threshold_pct {
            LeakVerdict::PossibleLeak
        } else {
            LeakVerdict::Normal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LeakVerdict::Normal => "normal",
            LeakVerdict::PossibleLeak => "possible leak",
        }
    }
}
