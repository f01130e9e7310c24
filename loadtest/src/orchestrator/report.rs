//! Run report: the aggregate result of one load test and its artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, VerdictThresholds};
use crate::load::{ConnectionSummary, PressureResult};
use crate::monitor::{LeakVerdict, MemorySample, MemoryStats, samples_to_csv};

pub const REPORT_JSON: &str = "websocket_perf_report.json";
pub const REPORT_TEXT: &str = "websocket_perf_report.txt";
pub const MEMORY_CSV: &str = "websocket_perf_memory.csv";

const LEAK_NOTE: &str = "Leak flag is a heuristic on |final - initial| / initial; it is not proof of a leak.";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one phase. Phases are never omitted from a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseReport<T> {
    Completed { result: T },
    /// The phase started but did not finish; `result` is what was collected
    Partial { result: T, reason: String },
    Skipped { reason: String },
}

impl<T> PhaseReport<T> {
    pub fn result(&self) -> Option<&T> {
        match self {
            PhaseReport::Completed { result } | PhaseReport::Partial { result, .. } => Some(result),
            PhaseReport::Skipped { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PhaseReport::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PhaseReport::Skipped { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            PhaseReport::Completed { .. } => "completed",
            PhaseReport::Partial { .. } => "partial",
            PhaseReport::Skipped { .. } => "skipped",
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            PhaseReport::Completed { .. } => None,
            PhaseReport::Partial { reason, .. } | PhaseReport::Skipped { reason } => Some(reason),
        }
    }
}

/// Memory observation of the server process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryReport {
    pub pid: u32,
    pub process_name: String,
    pub threshold_pct: f64,
    /// `None` when not a single sample was taken
    pub stats: Option<MemoryStats>,
    pub growth_mb: f64,
    pub growth_ratio_pct: f64,
    pub leak_verdict: Option<LeakVerdict>,
    pub note: String,
    pub samples: Vec<MemorySample>,
}

impl MemoryReport {
    pub fn new(
        pid: u32,
        process_name: String,
        threshold_pct: f64,
        baseline: Option<u64>,
        samples: &[MemorySample],
    ) -> Self {
        let stats = MemoryStats::with_baseline(baseline, samples);
        Self {
            pid,
            process_name,
            threshold_pct,
            growth_mb: stats.as_ref().map_or(0.0, MemoryStats::growth_mb),
            growth_ratio_pct: stats.as_ref().map_or(0.0, MemoryStats::growth_ratio_pct),
            leak_verdict: stats.as_ref().map(|s| s.verdict(threshold_pct)),
            stats,
            note: LEAK_NOTE.to_string(),
            samples: samples.to_vec(),
        }
    }

    pub fn to_csv(&self) -> String {
        samples_to_csv(&self.samples)
    }
}

/// Teardown tally
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TeardownSummary {
    pub agents: usize,
    /// Agents whose connection was actually closed by teardown
    pub disconnected: usize,
    pub duration_secs: f64,
}

/// Why the run stopped early
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbortInfo {
    pub phase: String,
    pub reason: String,
}

/// Overall qualitative verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Excellent,
    Good,
    NeedsImprovement,
}

impl Verdict {
    /// Both rates are percentages. Missing memory data counts as no growth.
    pub fn assess(
        connect_rate: f64,
        pressure_rate: f64,
        memory_growth_mb: Option<f64>,
        thresholds: &VerdictThresholds,
    ) -> Self {
        let growth = memory_growth_mb.unwrap_or(0.0).abs();
        if connect_rate >= thresholds.excellent_rate
            && pressure_rate >= thresholds.excellent_rate
            && growth < thresholds.memory_growth_limit_mb
        {
            Verdict::Excellent
        } else if connect_rate >= thresholds.good_rate && pressure_rate >= thresholds.good_rate {
            Verdict::Good
        } else {
            Verdict::NeedsImprovement
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Excellent => "excellent",
            Verdict::Good => "good",
            Verdict::NeedsImprovement => "needs improvement",
        }
    }
}

/// Settings the run was executed with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    pub ws_url: String,
    pub route_key_field: String,
    pub connections: usize,
    pub targets_requested: usize,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub connect_timeout_secs: f64,
    pub settle_secs: f64,
    pub pressure_duration_secs: f64,
    pub message_interval_ms: u64,
    pub hard_deadline: bool,
    pub memory_interval_secs: f64,
    pub memory_grace_secs: f64,
    pub process_pattern: String,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            route_key_field: config.route_key_field.clone(),
            connections: config.connections.total,
            targets_requested: config.fixture.target_count,
            batch_size: config.connections.batch_size,
            batch_pause_ms: config.connections.batch_pause.as_millis() as u64,
            connect_timeout_secs: config.connections.connect_timeout.as_secs_f64(),
            settle_secs: config.connections.settle_interval.as_secs_f64(),
            pressure_duration_secs: config.pressure.duration.as_secs_f64(),
            message_interval_ms: config.pressure.message_interval.as_millis() as u64,
            hard_deadline: config.pressure.hard_deadline,
            memory_interval_secs: config.monitor.interval.as_secs_f64(),
            memory_grace_secs: config.monitor.grace_period.as_secs_f64(),
            process_pattern: config.monitor.process_pattern.clone(),
        }
    }
}

/// Aggregate result of one run. Written once at the end of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub settings: RunSettings,
    pub targets_used: usize,
    pub connection: PhaseReport<ConnectionSummary>,
    /// Requested agents that never connected
    pub shortfall: usize,
    /// Whether the run went on despite a shortfall; `None` without a shortfall
    pub continued_after_shortfall: Option<bool>,
    pub pressure: PhaseReport<PressureResult>,
    pub memory: PhaseReport<MemoryReport>,
    pub teardown: TeardownSummary,
    pub verdict: Verdict,
    pub abort: Option<AbortInfo>,
}

/// Where `write_to` put the artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub text: PathBuf,
    pub memory_csv: Option<PathBuf>,
}

impl TestReport {
    pub fn connect_success_rate(&self) -> f64 {
        self.connection.result().map_or(0.0, |c| c.success_rate)
    }

    pub fn pressure_success_rate(&self) -> f64 {
        self.pressure.result().map_or(0.0, |p| p.success_rate)
    }

    pub fn memory_growth_mb(&self) -> Option<f64> {
        self.memory
            .result()
            .filter(|m| m.stats.is_some())
            .map(|m| m.growth_mb)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    /// Write the JSON report, the text summary and, when memory was sampled,
    /// the memory time series.
    pub fn write_to(&self, dir: &Path) -> Result<ReportPaths, ReportError> {
        fs::create_dir_all(dir)?;

        let json = dir.join(REPORT_JSON);
        fs::write(&json, serde_json::to_string_pretty(self)?)?;

        let text = dir.join(REPORT_TEXT);
        fs::write(&text, self.to_string())?;

        let memory_csv = match self.memory.result() {
            Some(memory) if !memory.samples.is_empty() => {
                let path = dir.join(MEMORY_CSV);
                fs::write(&path, memory.to_csv())?;
                Some(path)
            }
            _ => None,
        };

        Ok(ReportPaths {
            json,
            text,
            memory_csv,
        })
    }
}

fn write_skip<T>(f: &mut fmt::Formatter<'_>, phase: &PhaseReport<T>) -> fmt::Result {
    if let Some(reason) = phase.reason() {
        writeln!(f, "   Status:              {} ({})", phase.status(), reason)?;
    }
    Ok(())
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═══════════════════════════════════════════════════════════════";

        writeln!(f, "{}", rule)?;
        writeln!(f, " WEBSOCKET LOAD TEST REPORT")?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "   Run:                 {}", self.run_id)?;
        writeln!(
            f,
            "   Started:             {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f, "   Duration:            {:.1}s", self.duration_secs)?;
        writeln!(f, "   Server:              {}", self.settings.ws_url)?;
        writeln!(
            f,
            "   Connections:         {} over {} targets",
            self.settings.connections, self.targets_used
        )?;
        writeln!(
            f,
            "   Pressure:            {:.0}s at one message per {} ms",
            self.settings.pressure_duration_secs, self.settings.message_interval_ms
        )?;
        writeln!(f)?;

        writeln!(f, " ─── Connection ──────────────────────────────────────────────")?;
        write_skip(f, &self.connection)?;
        if let Some(c) = self.connection.result() {
            writeln!(f, "   Requested:           {}", c.requested)?;
            writeln!(f, "   Successful:          {}", c.successful_connections)?;
            writeln!(
                f,
                "   Failed:              {} ({} timed out)",
                c.failed_connections, c.timed_out
            )?;
            writeln!(f, "   Success rate:        {:.2}%", c.success_rate)?;
            writeln!(
                f,
                "   Connect time:        min {:.3} / avg {:.3} / max {:.3} ms",
                c.connect_time.min_ms, c.connect_time.avg_ms, c.connect_time.max_ms
            )?;
            if let Some(stable) = c.stable_connections {
                writeln!(f, "   Stable after settle: {}", stable)?;
            }
        }
        if self.shortfall > 0 {
            let decision = match self.continued_after_shortfall {
                Some(false) => "run stopped",
                _ => "run continued",
            };
            writeln!(
                f,
                "   Shortfall:           {} agents not connected, {}",
                self.shortfall, decision
            )?;
        }
        writeln!(f)?;

        writeln!(f, " ─── Pressure ────────────────────────────────────────────────")?;
        write_skip(f, &self.pressure)?;
        if let Some(p) = self.pressure.result() {
            writeln!(f, "   Active agents:       {}", p.active_agent_count)?;
            writeln!(
                f,
                "   Elapsed:             {:.1}s (requested {:.1}s, overrun {:.3}s)",
                p.total_duration_secs, p.requested_duration_secs, p.overrun_secs
            )?;
            writeln!(f, "   Total messages:      {}", p.total_messages())?;
            writeln!(f, "   Sent:                {}", p.messages_sent)?;
            writeln!(f, "   Failed:              {}", p.messages_failed)?;
            writeln!(f, "   Received:            {}", p.messages_received)?;
            writeln!(f, "   Throughput:          {:.2} msg/s", p.messages_per_second)?;
            writeln!(f, "   Success rate:        {:.2}%", p.success_rate)?;
        }
        writeln!(f)?;

        writeln!(f, " ─── Memory ──────────────────────────────────────────────────")?;
        write_skip(f, &self.memory)?;
        if let Some(m) = self.memory.result() {
            writeln!(f, "   Process:             {} (pid {})", m.process_name, m.pid)?;
            match &m.stats {
                Some(s) => {
                    let mib = |bytes: f64| bytes / (1024.0 * 1024.0);
                    writeln!(f, "   Samples:             {}", s.sample_count)?;
                    writeln!(f, "   Initial:             {:.1} MiB", mib(s.initial_bytes as f64))?;
                    writeln!(f, "   Final:               {:.1} MiB", mib(s.final_bytes as f64))?;
                    writeln!(f, "   Peak:                {:.1} MiB", mib(s.peak_bytes as f64))?;
                    writeln!(f, "   Average:             {:.1} MiB", mib(s.average_bytes))?;
                    writeln!(
                        f,
                        "   Growth:              {:+.1} MiB ({:.1}%)",
                        m.growth_mb, m.growth_ratio_pct
                    )?;
                    if let Some(verdict) = m.leak_verdict {
                        writeln!(
                            f,
                            "   Leak check:          {} (threshold {:.0}%)",
                            verdict.label(),
                            m.threshold_pct
                        )?;
                    }
                    writeln!(f, "   Note:                {}", m.note)?;
                }
                None => writeln!(f, "   Samples:             0")?,
            }
        }
        writeln!(f)?;

        writeln!(f, " ─── Teardown ────────────────────────────────────────────────")?;
        writeln!(
            f,
            "   Disconnected:        {} of {} agents in {:.2}s",
            self.teardown.disconnected, self.teardown.agents, self.teardown.duration_secs
        )?;
        writeln!(f)?;

        writeln!(f, "{}", rule)?;
        if let Some(abort) = &self.abort {
            writeln!(f, " ABORTED during {}: {}", abort.phase, abort.reason)?;
        }
        writeln!(f, " OVERALL: {}", self.verdict.label().to_uppercase())?;
        writeln!(f, "{}", rule)
    }
}
