//! Simulated clients
//!
//! This module provides:
//! - `ConnectionAgent`: one client's connection lifecycle, send path and counters
//! - `AgentState` / `AgentStats`: the lifecycle state machine and its snapshots
//! - `build_agents`: lays out N agents across a fixed pool of target keys

mod connection;
mod state;

use std::sync::Arc;

pub use connection::ConnectionAgent;
pub use state::{AgentError, AgentState, AgentStats};

use crate::config::AgentConfig;
use crate::transport::Transport;

/// Stable identity of the agent at `index`
pub fn agent_id(index: usize) -> String {
    format!("perf_test_client_{:04}", index)
}

/// Target index for each of `total` agents over `targets` keys.
///
/// Agents are laid out target-major: with `per_target = total / targets`,
/// agent `i` goes to target `i / per_target`; the remainder is round-robined.
pub fn assign_targets(total: usize, targets: usize) -> Vec<usize> {
    if targets == 0 {
        return Vec::new();
    }
    let per_target = (total / targets).max(1);
    let block = per_target * targets.min(total / per_target);

    (0..total)
        .map(|i| {
            if i < block {
                i / per_target
            } else {
                (i - block) % targets
            }
        })
        .collect()
}

/// Build `total` agents spread over `target_keys`
pub fn build_agents(
    total: usize,
    target_keys: &[String],
    route_key_field: &str,
    config: &AgentConfig,
    transport: Arc<dyn Transport>,
) -> Vec<Arc<ConnectionAgent>> {
    assign_targets(total, target_keys.len())
        .into_iter()
        .enumerate()
        .map(|(i, target)| {
            Arc::new(ConnectionAgent::new(
                agent_id(i),
                target_keys[target].clone(),
                route_key_field,
                config.clone(),
                Arc::clone(&transport),
            ))
        })
        .collect()
}
