//! Server process memory sampling
//!
//! This module provides:
//! - `ProcessLocator` / `ProcessHandle`: pluggable process discovery, with a
//!   `sysinfo` implementation
//! - `ResourceMonitor`: averages a few pre-load readings into a baseline, then
//!   samples resident memory at a fixed interval over an observation window
//! - `MemoryStats` / `LeakVerdict`: growth summary and the heuristic leak flag

mod process;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use process::{ProcessHandle, ProcessInfo, ProcessLocator, SysinfoLocator, pattern_matcher};
pub use types::{
    LeakVerdict, MemorySample, MemorySeries, MemoryStats, MonitorError, samples_to_csv,
};

use crate::config::MonitorConfig;

/// Samples one process's resident memory concurrently with the load phases
pub struct ResourceMonitor {
    config: MonitorConfig,
    locator: Arc<dyn ProcessLocator>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, locator: Arc<dyn ProcessLocator>) -> Self {
        Self { config, locator }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Observation window for a pressure phase of `pressure_duration`
    pub fn window(&self, pressure_duration: Duration) -> Duration {
        pressure_duration + self.config.grace_period
    }

    /// Find the process to observe by the configured pattern
    pub fn locate(&self) -> Result<Box<dyn ProcessHandle>, MonitorError> {
        let matcher = pattern_matcher(&self.config.process_pattern);
        let handle = self
            .locator
            .find(&matcher)
            .ok_or_else(|| MonitorError::ProcessNotFound(self.config.process_pattern.clone()))?;
        info!(
            "Monitoring process {} (pid {})",
            handle.name(),
            handle.pid()
        );
        Ok(handle)
    }

    /// Average `baseline_samples` readings spaced by `baseline_interval` into
    /// the series' baseline. Called before any load is applied.
    pub async fn baseline(
        &self,
        handle: &mut dyn ProcessHandle,
        series: &mut MemorySeries,
    ) -> Result<(), MonitorError> {
        let count = self.config.baseline_samples;
        if count == 0 {
            return Ok(());
        }

        let mut total: u64 = 0;
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(self.config.baseline_interval).await;
            }
            total += handle.resident_bytes()?;
        }
        let average = total / count as u64;
        series.set_baseline(average);
        info!(
            "Memory baseline over {} readings: {:.1} MiB",
            count,
            average as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    /// Sample `handle` every interval until `window` has elapsed, appending to
    /// `series`.
    ///
    /// Samples already taken stay in `series` if the process disappears or the
    /// caller drops this future.
    pub async fn observe(
        &self,
        handle: &mut dyn ProcessHandle,
        window: Duration,
        series: &mut MemorySeries,
    ) -> Result<(), MonitorError> {
        let start = Instant::now();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let elapsed = start.elapsed();
            if elapsed >= window {
                break;
            }

            let bytes = match handle.resident_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Memory sampling stopped after {} samples: {}", series.len(), e);
                    return Err(e);
                }
            };
            if series.record(elapsed.as_secs_f64(), bytes) {
                metrics::gauge!("ws_loadtest_server_resident_bytes").set(bytes as f64);
                debug!(
                    "Memory sample at {:.1}s: {:.1} MiB",
                    elapsed.as_secs_f64(),
                    bytes as f64 / (1024.0 * 1024.0)
                );
            }
        }

        info!("Memory sampling finished with {} samples", series.len());
        Ok(())
    }

    /// Locate, take the baseline and observe in one step
    pub async fn run(&self, window: Duration, series: &mut MemorySeries) -> Result<(), MonitorError> {
        let mut handle = self.locate()?;
        self.baseline(handle.as_mut(), series).await?;
        self.observe(handle.as_mut(), window, series).await
    }
}
