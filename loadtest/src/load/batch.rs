//! Connection phase: open N agents in bounded, paced batches

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::stats::{DurationStats, DurationSummary, percent};
use crate::agent::{AgentStats, ConnectionAgent};
use crate::config::ConnectionConfig;

/// Outcome of one connect attempt, produced once per agent
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionAttemptResult {
    pub agent_id: String,
    pub batch: usize,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Per-batch tally
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub index: usize,
    pub size: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Aggregate result of the connection phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSummary {
    pub requested: usize,
    pub successful_connections: usize,
    pub failed_connections: usize,
    /// Attempts that failed because the handshake exceeded the timeout
    pub timed_out: usize,
    /// `100 * successful / requested`, 0 when nothing was requested
    pub success_rate: f64,
    /// Durations of successful handshakes
    pub connect_time: DurationSummary,
    pub total_time_secs: f64,
    pub batches: Vec<BatchSummary>,
    /// Agents still connected after the settle interval
    pub stable_connections: Option<usize>,
}

impl ConnectionSummary {
    /// Agents that were requested but never connected
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.successful_connections)
    }

    /// Accepted connections the peer dropped during the settle interval
    pub fn dropped_after_settle(&self) -> Option<usize> {
        self.stable_connections
            .map(|stable| self.successful_connections.saturating_sub(stable))
    }

    /// Tally rebuilt from agent snapshots for a phase that was cut short.
    /// Attempts still in flight count as neither success nor failure.
    pub fn from_agent_stats(requested: usize, stats: &[AgentStats], total_time: Duration) -> Self {
        let successful = stats.iter().filter(|s| s.connect_time.is_some()).count();
        let failed = stats.iter().filter(|s| s.failed).count();
        Self {
            requested,
            successful_connections: successful,
            failed_connections: failed,
            timed_out: 0,
            success_rate: percent(successful as u64, requested as u64),
            connect_time: DurationSummary::default(),
            total_time_secs: total_time.as_secs_f64(),
            batches: Vec::new(),
            stable_connections: None,
        }
    }
}

/// Single-consumer aggregator for attempt results
struct Aggregator {
    requested: usize,
    successful: usize,
    failed: usize,
    timed_out: usize,
    durations: DurationStats,
    batches: Vec<BatchSummary>,
}

impl Aggregator {
    fn new(requested: usize) -> Self {
        Self {
            requested,
            successful: 0,
            failed: 0,
            timed_out: 0,
            durations: DurationStats::new(),
            batches: Vec::new(),
        }
    }

    fn record(&mut self, result: ConnectionAttemptResult, timed_out: bool) {
        while self.batches.len() <= result.batch {
            let index = self.batches.len();
            self.batches.push(BatchSummary {
                index,
                ..Default::default()
            });
        }
        let batch = &mut self.batches[result.batch];
        batch.size += 1;

        if result.success {
            self.successful += 1;
            batch.successful += 1;
            self.durations.record(result.duration);
            metrics::counter!("ws_loadtest_connect_attempts_total", "outcome" => "success")
                .increment(1);
        } else {
            self.failed += 1;
            batch.failed += 1;
            if timed_out {
                self.timed_out += 1;
            }
            metrics::counter!("ws_loadtest_connect_attempts_total", "outcome" => "failure")
                .increment(1);
        }
    }

    fn finish(self, total_time: Duration) -> ConnectionSummary {
        ConnectionSummary {
            requested: self.requested,
            successful_connections: self.successful,
            failed_connections: self.failed,
            timed_out: self.timed_out,
            success_rate: percent(self.successful as u64, self.requested as u64),
            connect_time: self.durations.summary(),
            total_time_secs: total_time.as_secs_f64(),
            batches: self.batches,
            stable_connections: None,
        }
    }
}

/// Opens agents' connections batch by batch.
///
/// Batches are strictly sequential; attempts within a batch run
/// concurrently and are isolated from each other (a failing or panicking
/// attempt only counts as one failure).
pub struct BatchConnector {
    config: ConnectionConfig,
}

impl BatchConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Connect every agent and aggregate the outcomes
    pub async fn connect_all(&self, agents: &[Arc<ConnectionAgent>]) -> ConnectionSummary {
        let start = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let batch_count = agents.len().div_ceil(batch_size);

        info!(
            "Connecting {} agents in {} batches of up to {}",
            agents.len(),
            batch_count,
            batch_size
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<(ConnectionAttemptResult, bool)>();
        let requested = agents.len();
        let aggregator = tokio::spawn(async move {
            let mut aggregator = Aggregator::new(requested);
            while let Some((result, timed_out)) = rx.recv().await {
                aggregator.record(result, timed_out);
            }
            aggregator
        });

        for (index, batch) in agents.chunks(batch_size).enumerate() {
            debug!("Starting batch {} ({} agents)", index + 1, batch.len());
            self.run_batch(index, batch, &tx).await;

            if index + 1 < batch_count && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }
        drop(tx);

        let aggregator = match aggregator.await {
            Ok(aggregator) => aggregator,
            Err(e) => {
                warn!("Connection aggregator failed: {}", e);
                Aggregator::new(requested)
            }
        };
        let summary = aggregator.finish(start.elapsed());

        info!(
            "Connection phase done: {}/{} connected ({:.2}%), {} failed, avg connect {:.3} ms",
            summary.successful_connections,
            summary.requested,
            summary.success_rate,
            summary.failed_connections,
            summary.connect_time.avg_ms
        );
        summary
    }

    /// Issue one batch concurrently and wait for every attempt to resolve
    async fn run_batch(
        &self,
        index: usize,
        batch: &[Arc<ConnectionAgent>],
        tx: &mpsc::UnboundedSender<(ConnectionAttemptResult, bool)>,
    ) {
        let timeout = self.config.connect_timeout;
        let mut set = JoinSet::new();
        let mut owners = HashMap::new();

        for agent in batch {
            let agent = Arc::clone(agent);
            let tx = tx.clone();
            let agent_id = agent.id().to_string();
            let handle = set.spawn(async move {
                let start = Instant::now();
                let outcome = agent.connect(timeout).await;
                let (result, timed_out) = match outcome {
                    Ok(duration) => (
                        ConnectionAttemptResult {
                            agent_id: agent.id().to_string(),
                            batch: index,
                            success: true,
                            duration,
                            error: None,
                        },
                        false,
                    ),
                    Err(e) => (
                        ConnectionAttemptResult {
                            agent_id: agent.id().to_string(),
                            batch: index,
                            success: false,
                            duration: start.elapsed(),
                            error: Some(e.to_string()),
                        },
                        e.is_timeout(),
                    ),
                };
                let _ = tx.send((result, timed_out));
            });
            owners.insert(handle.id(), agent_id);
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                // The attempt never reported; count it here so totals stay exact
                let agent_id = owners.get(&e.id()).cloned().unwrap_or_default();
                warn!(agent = %agent_id, "Connect attempt aborted: {}", e);
                let _ = tx.send((
                    ConnectionAttemptResult {
                        agent_id,
                        batch: index,
                        success: false,
                        duration: Duration::ZERO,
                        error: Some(e.to_string()),
                    },
                    false,
                ));
            }
        }
    }

    /// Wait for the settle interval, then count agents still connected.
    ///
    /// Distinguishes accepted handshakes from stable connections: a peer
    /// may accept and then close immediately.
    pub async fn settle(&self, agents: &[Arc<ConnectionAgent>]) -> usize {
        if !self.config.settle_interval.is_zero() {
            info!(
                "Waiting {:?} for connections to settle",
                self.config.settle_interval
            );
            tokio::time::sleep(self.config.settle_interval).await;
        }
        let stable = agents.iter().filter(|a| a.is_connected()).count();
        info!("Stable connections after settle: {}", stable);
        stable
    }
}
