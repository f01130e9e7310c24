//! Run sequencing
//!
//! `LoadTestOrchestrator` drives one run end to end:
//! fixtures, connection phase, settle check, pressure and memory sampling in
//! parallel, teardown, report. Whatever stops the run (a fatal fixture
//! error, the run timeout or a shutdown signal), teardown still disconnects
//! every agent and the report carries whatever was collected.

pub mod report;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentStats, ConnectionAgent, build_agents};
use crate::config::Config;
use crate::fixture::{FixtureError, FixtureService, Target, provision_targets};
use crate::load::{BatchConnector, ConnectionSummary, PressureDriver, PressureResult};
use crate::monitor::{MemorySeries, MonitorError, ProcessLocator, ResourceMonitor};
use crate::transport::Transport;

pub use report::{
    AbortInfo, MemoryReport, PhaseReport, ReportError, ReportPaths, RunSettings, TeardownSummary,
    TestReport, Verdict,
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Fixture(#[from] FixtureError),

    #[error("Run aborted during {phase}: {reason}")]
    Aborted { phase: String, reason: String },

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl TestReport {
    /// `Err` when the run stopped before completing every phase
    pub fn outcome(&self) -> Result<(), RunError> {
        match &self.abort {
            Some(abort) => Err(RunError::Aborted {
                phase: abort.phase.clone(),
                reason: abort.reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Decides whether a run with fewer connections than requested goes on to
/// the pressure phase
pub trait ShortfallPolicy: Send + Sync {
    fn should_continue(&self, summary: &ConnectionSummary) -> bool;
}

/// Fixed answer, taken from configuration
#[derive(Debug, Clone, Copy)]
pub struct ContinueOnShortfall(pub bool);

impl ShortfallPolicy for ContinueOnShortfall {
    fn should_continue(&self, _summary: &ConnectionSummary) -> bool {
        self.0
    }
}

/// Decides from the connection summary
pub struct ShortfallFn<F>(pub F);

impl<F> ShortfallPolicy for ShortfallFn<F>
where
    F: Fn(&ConnectionSummary) -> bool + Send + Sync,
{
    fn should_continue(&self, summary: &ConnectionSummary) -> bool {
        (self.0)(summary)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Fixture,
    Connection,
    Settle,
    Pressure,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Fixture => "fixture",
            Phase::Connection => "connection",
            Phase::Settle => "settle",
            Phase::Pressure => "pressure",
        }
    }
}

/// Everything a run has gathered so far. Phases write here as they go so
/// an interrupted run still has its partial results.
#[derive(Default)]
struct Collected {
    phase: Phase,
    targets: Vec<Target>,
    agents: Vec<Arc<ConnectionAgent>>,
    connect_started: Option<Instant>,
    connection: Option<ConnectionSummary>,
    continued_after_shortfall: Option<bool>,
    pressure_started: Option<(Instant, Vec<AgentStats>)>,
    pressure: Option<PressureResult>,
    process: Option<(u32, String)>,
    memory: MemorySeries,
    memory_finished: bool,
    memory_error: Option<MonitorError>,
}

enum Stop {
    Finished(Result<(), RunError>),
    Interrupted(&'static str),
}

pub struct LoadTestOrchestrator {
    config: Config,
    fixtures: Arc<dyn FixtureService>,
    transport: Arc<dyn Transport>,
    monitor: ResourceMonitor,
    shortfall: Box<dyn ShortfallPolicy>,
}

impl LoadTestOrchestrator {
    pub fn new(
        config: Config,
        fixtures: Arc<dyn FixtureService>,
        transport: Arc<dyn Transport>,
        locator: Arc<dyn ProcessLocator>,
    ) -> Self {
        let monitor = ResourceMonitor::new(config.monitor.clone(), locator);
        let shortfall = Box::new(ContinueOnShortfall(config.continue_on_shortfall));
        Self {
            config,
            fixtures,
            transport,
            monitor,
            shortfall,
        }
    }

    pub fn with_shortfall_policy(mut self, policy: impl ShortfallPolicy + 'static) -> Self {
        self.shortfall = Box::new(policy);
        self
    }

    /// Run to completion, bounded only by the configured run timeout
    pub async fn run(&self) -> TestReport {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run until completion, the run timeout, or `shutdown` resolving,
    /// whichever comes first. Always tears down and always returns a report.
    pub async fn run_with_shutdown<F>(&self, shutdown: F) -> TestReport
    where
        F: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Starting load test run {}", run_id);

        let mut collected = Collected::default();
        let stop = {
            let phases = self.phases(&mut collected);
            let run_timeout = self.config.run_timeout;
            let deadline = async move {
                match run_timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = phases => Stop::Finished(result),
                _ = shutdown => Stop::Interrupted("interrupted by shutdown signal"),
                _ = deadline => Stop::Interrupted("run timeout exceeded"),
            }
        };

        let abort = match stop {
            Stop::Finished(Ok(())) => None,
            Stop::Finished(Err(e)) => {
                error!("Run failed during {} phase: {}", collected.phase.name(), e);
                Some(AbortInfo {
                    phase: collected.phase.name().to_string(),
                    reason: e.to_string(),
                })
            }
            Stop::Interrupted(reason) => {
                warn!("Run stopped during {} phase: {}", collected.phase.name(), reason);
                Some(AbortInfo {
                    phase: collected.phase.name().to_string(),
                    reason: reason.to_string(),
                })
            }
        };

        let teardown = teardown(&collected.agents).await;
        let report = self.build_report(run_id, started_at, start, collected, teardown, abort);
        info!(
            "Run {} finished in {:.1}s: {}",
            run_id,
            report.duration_secs,
            report.verdict.label()
        );
        report
    }

    async fn phases(&self, c: &mut Collected) -> Result<(), RunError> {
        c.phase = Phase::Fixture;
        c.targets =
            provision_targets(self.fixtures.as_ref(), &self.config.credentials, &self.config.fixture)
                .await?;
        let keys: Vec<String> = c.targets.iter().map(|t| t.key.clone()).collect();
        c.agents = build_agents(
            self.config.connections.total,
            &keys,
            &self.config.route_key_field,
            &self.config.agent,
            Arc::clone(&self.transport),
        );
        info!(
            "Prepared {} agents over {} targets",
            c.agents.len(),
            keys.len()
        );

        c.phase = Phase::Connection;
        c.connect_started = Some(Instant::now());
        let connector = BatchConnector::new(self.config.connections.clone());
        c.connection = Some(connector.connect_all(&c.agents).await);

        c.phase = Phase::Settle;
        let stable = connector.settle(&c.agents).await;
        let Some(summary) = c.connection.as_mut() else {
            return Ok(());
        };
        summary.stable_connections = Some(stable);
        if let Some(dropped) = summary.dropped_after_settle()
            && dropped > 0
        {
            warn!("{} accepted connections dropped during settle", dropped);
        }

        let shortfall = summary.shortfall();
        if shortfall > 0 {
            let go_on = self.shortfall.should_continue(summary);
            warn!(
                "Shortfall: {} of {} agents connected; {}",
                summary.successful_connections,
                summary.requested,
                if go_on { "continuing" } else { "stopping" }
            );
            c.continued_after_shortfall = Some(go_on);
            if !go_on {
                return Ok(());
            }
        }

        c.phase = Phase::Pressure;
        let mut handle = match self.monitor.locate() {
            Ok(handle) => {
                c.process = Some((handle.pid(), handle.name().to_string()));
                Some(handle)
            }
            Err(e) => {
                warn!("Skipping memory monitoring: {}", e);
                c.memory_error = Some(e);
                None
            }
        };
        let baseline = match handle.as_mut() {
            Some(handle) => self.monitor.baseline(handle.as_mut(), &mut c.memory).await,
            None => Ok(()),
        };
        if let Err(e) = baseline {
            warn!("Skipping memory monitoring: {}", e);
            c.memory_error = Some(e);
            handle = None;
        }
        c.pressure_started = Some((Instant::now(), c.agents.iter().map(|a| a.stats()).collect()));

        let driver = PressureDriver::new(self.config.pressure.clone());
        let window = self.monitor.window(self.config.pressure.duration);
        let agents = &c.agents;
        let pressure_slot = &mut c.pressure;
        let memory = &mut c.memory;
        let memory_finished = &mut c.memory_finished;
        let memory_error = &mut c.memory_error;

        let pressure = async {
            *pressure_slot = Some(driver.run(agents).await);
        };
        let sampling = async {
            if let Some(mut handle) = handle {
                if let Err(e) = self.monitor.observe(handle.as_mut(), window, memory).await {
                    *memory_error = Some(e);
                }
                *memory_finished = true;
            }
        };
        tokio::join!(pressure, sampling);

        Ok(())
    }

    fn build_report(
        &self,
        run_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        c: Collected,
        teardown: TeardownSummary,
        abort: Option<AbortInfo>,
    ) -> TestReport {
        let interrupted = abort
            .as_ref()
            .map_or_else(|| "run stopped".to_string(), |a| a.reason.clone());

        let connection = match (c.connection, c.connect_started) {
            (Some(summary), _) => PhaseReport::Completed { result: summary },
            (None, Some(started)) => {
                let stats: Vec<AgentStats> = c.agents.iter().map(|a| a.stats()).collect();
                PhaseReport::Partial {
                    result: ConnectionSummary::from_agent_stats(
                        c.agents.len(),
                        &stats,
                        started.elapsed(),
                    ),
                    reason: interrupted.clone(),
                }
            }
            (None, None) => PhaseReport::Skipped {
                reason: "fixture setup did not complete".to_string(),
            },
        };
        let shortfall = connection.result().map_or(0, ConnectionSummary::shortfall);

        let pressure = match (c.pressure, c.pressure_started) {
            (Some(result), _) => PhaseReport::Completed { result },
            (None, Some((started, before))) => {
                let after: Vec<AgentStats> = c.agents.iter().map(|a| a.stats()).collect();
                PhaseReport::Partial {
                    result: PressureResult::from_agent_deltas(
                        &before,
                        &after,
                        self.config.pressure.duration,
                        started.elapsed(),
                    ),
                    reason: interrupted.clone(),
                }
            }
            (None, None) if c.continued_after_shortfall == Some(false) => PhaseReport::Skipped {
                reason: format!("{} agents not connected, run not continued", shortfall),
            },
            (None, None) => PhaseReport::Skipped {
                reason: "not reached".to_string(),
            },
        };

        let memory = match (c.process, c.memory_error) {
            (None, Some(e)) => PhaseReport::Skipped {
                reason: e.to_string(),
            },
            (None, None) => PhaseReport::Skipped {
                reason: "not reached".to_string(),
            },
            (Some((pid, name)), error) => {
                let result = MemoryReport::new(
                    pid,
                    name,
                    self.config.monitor.leak_threshold_pct,
                    c.memory.baseline(),
                    c.memory.samples(),
                );
                match error {
                    Some(e) => PhaseReport::Partial {
                        result,
                        reason: e.to_string(),
                    },
                    None if !c.memory_finished => PhaseReport::Partial {
                        result,
                        reason: interrupted.clone(),
                    },
                    None => PhaseReport::Completed { result },
                }
            }
        };

        let mut report = TestReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_secs: start.elapsed().as_secs_f64(),
            settings: RunSettings::from(&self.config),
            targets_used: c.targets.len(),
            connection,
            shortfall,
            continued_after_shortfall: c.continued_after_shortfall,
            pressure,
            memory,
            teardown,
            verdict: Verdict::NeedsImprovement,
            abort,
        };
        report.verdict = Verdict::assess(
            report.connect_success_rate(),
            report.pressure_success_rate(),
            report.memory_growth_mb(),
            &self.config.verdict,
        );
        report
    }
}

/// Disconnect every agent concurrently. Agents that are already
/// disconnected (or never connected) are no-ops.
async fn teardown(agents: &[Arc<ConnectionAgent>]) -> TeardownSummary {
    let start = Instant::now();
    let mut set = JoinSet::new();
    for agent in agents {
        let agent = Arc::clone(agent);
        set.spawn(async move { agent.disconnect().await });
    }

    let mut disconnected = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(true) => disconnected += 1,
            Ok(false) => {}
            Err(e) => warn!("Disconnect task failed: {}", e),
        }
    }

    info!(
        "Teardown: disconnected {} of {} agents",
        disconnected,
        agents.len()
    );
    TeardownSummary {
        agents: agents.len(),
        disconnected,
        duration_secs: start.elapsed().as_secs_f64(),
    }
}
