//! Pressure phase: every connected agent sends at a fixed rate for a fixed
//! wall-clock duration

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::stats::percent;
use crate::agent::{AgentStats, ConnectionAgent};
use crate::config::PressureConfig;

/// What one agent's pressure loop did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentPressureRecord {
    pub agent_id: String,
    pub sent: u64,
    pub failed: u64,
    pub received: u64,
}

/// Aggregate result of the pressure phase.
///
/// `messages_sent + messages_failed` is exactly the number of send attempts
/// made by the participating agents during the phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PressureResult {
    pub requested_duration_secs: f64,
    /// Measured wall-clock length of the phase
    pub total_duration_secs: f64,
    /// How far past the requested duration the last loop finished
    pub overrun_secs: f64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    /// Inbound messages the participating agents received during the phase
    pub messages_received: u64,
    pub active_agent_count: usize,
    pub messages_per_second: f64,
    /// `100 * sent / (sent + failed)`, 0 when nothing was attempted
    pub success_rate: f64,
    pub hard_deadline: bool,
}

impl PressureResult {
    pub fn total_messages(&self) -> u64 {
        self.messages_sent + self.messages_failed
    }

    fn finish(&mut self, requested: Duration, elapsed: Duration) {
        let elapsed_secs = elapsed.as_secs_f64();
        self.requested_duration_secs = requested.as_secs_f64();
        self.total_duration_secs = elapsed_secs;
        self.overrun_secs = (elapsed_secs - self.requested_duration_secs).max(0.0);
        self.messages_per_second = if elapsed_secs > 0.0 {
            self.total_messages() as f64 / elapsed_secs
        } else {
            0.0
        };
        self.success_rate = percent(self.messages_sent, self.total_messages());
    }

    /// Rebuild totals from agent counters when the phase was cut short and
    /// never reported; counts are whatever the agents recorded, not rolled back.
    pub fn from_agent_deltas(
        before: &[AgentStats],
        after: &[AgentStats],
        requested: Duration,
        elapsed: Duration,
    ) -> Self {
        let mut result = Self::default();
        for (b, a) in before.iter().zip(after) {
            let sent = a.messages_sent.saturating_sub(b.messages_sent);
            let failed = a.errors_sent.saturating_sub(b.errors_sent);
            if sent + failed > 0 {
                result.active_agent_count += 1;
            }
            result.messages_sent += sent;
            result.messages_failed += failed;
            result.messages_received += a.messages_received.saturating_sub(b.messages_received);
        }
        result.finish(requested, elapsed);
        result
    }
}

/// Drives connected agents at a fixed per-agent rate.
///
/// Agent loops are independent and may drift; the end condition is the
/// wall clock, not a message count.
pub struct PressureDriver {
    config: PressureConfig,
}

impl PressureDriver {
    pub fn new(config: PressureConfig) -> Self {
        Self { config }
    }

    /// Run the phase against the agents that are currently connected.
    /// Agents that never connected or dropped are excluded, not retried.
    pub async fn run(&self, agents: &[Arc<ConnectionAgent>]) -> PressureResult {
        let active: Vec<Arc<ConnectionAgent>> = agents
            .iter()
            .filter(|a| a.is_connected())
            .cloned()
            .collect();

        info!(
            "Pressure phase: {} active agents, {:?} duration, {:?} interval{}",
            active.len(),
            self.config.duration,
            self.config.message_interval,
            if self.config.hard_deadline {
                ", hard deadline"
            } else {
                ""
            }
        );

        let start = Instant::now();
        let deadline = start + self.config.duration;
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentPressureRecord>();
        let mut set = JoinSet::new();

        for agent in &active {
            let agent = Arc::clone(agent);
            let tx = tx.clone();
            let interval = self.config.message_interval;
            let hard_deadline = self.config.hard_deadline;
            set.spawn(async move {
                let received_before = agent.stats().messages_received;
                let mut record = AgentPressureRecord {
                    agent_id: agent.id().to_string(),
                    ..Default::default()
                };

                let drive = drive_agent(&agent, deadline, interval, &mut record);
                if hard_deadline {
                    let _ = tokio::time::timeout_at(deadline, drive).await;
                } else {
                    drive.await;
                }

                record.received = agent
                    .stats()
                    .messages_received
                    .saturating_sub(received_before);
                debug!(
                    agent = %record.agent_id,
                    sent = record.sent,
                    failed = record.failed,
                    received = record.received,
                    "Pressure loop finished"
                );
                let _ = tx.send(record);
            });
        }
        drop(tx);

        // Single consumer owns the running totals
        let mut result = PressureResult {
            active_agent_count: active.len(),
            hard_deadline: self.config.hard_deadline,
            ..Default::default()
        };
        while let Some(record) = rx.recv().await {
            result.messages_sent += record.sent;
            result.messages_failed += record.failed;
            result.messages_received += record.received;
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("Pressure loop aborted before reporting: {}", e);
            }
        }

        result.finish(self.config.duration, start.elapsed());

        info!(
            "Pressure phase done in {:.1}s (overrun {:.3}s): {} sent, {} failed, {:.2} msg/s, {:.2}% success",
            result.total_duration_secs,
            result.overrun_secs,
            result.messages_sent,
            result.messages_failed,
            result.messages_per_second,
            result.success_rate
        );
        result
    }
}

/// Send, record, sleep; the deadline is checked only between sends
async fn drive_agent(
    agent: &ConnectionAgent,
    deadline: Instant,
    interval: Duration,
    record: &mut AgentPressureRecord,
) {
    while Instant::now() < deadline {
        if agent.send_test_message().await {
            record.sent += 1;
        } else {
            record.failed += 1;
        }
        tokio::time::sleep(interval).await;
    }
}
