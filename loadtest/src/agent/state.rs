use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors an agent can report for its own lifecycle operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Agent is not connected")]
    NotConnected,

    #[error("Agent {0} has already been used in this run")]
    AlreadyUsed(String),

    #[error("Agent {0} was closed before it connected")]
    Closed(String),
}

impl AgentError {
    /// Whether the error is a handshake timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Transport(TransportError::ConnectTimeout(_)))
    }
}

/// Lifecycle of one agent.
///
/// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`,
/// with `Connecting -> Disconnected` on handshake failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AgentState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AgentState::Connecting,
            2 => AgentState::Connected,
            3 => AgentState::Disconnecting,
            _ => AgentState::Disconnected,
        }
    }
}

/// Lock-free state cell shared between an agent and its background tasks
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(AgentState::Disconnected as u8))
    }

    pub(crate) fn get(&self) -> AgentState {
        AgentState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: AgentState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to` only if the cell currently holds `from`
    pub(crate) fn transition(&self, from: AgentState, to: AgentState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Per-agent counters. Each field has exactly one writing path.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub errors_sent: AtomicU64,
    pub errors_received: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeat_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wall-clock milestones of one agent
#[derive(Debug, Default, Clone)]
pub(crate) struct Timeline {
    pub connect_time: Option<DateTime<Utc>>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// State shared between the agent handle and its receive/heartbeat tasks
#[derive(Debug)]
pub(crate) struct AgentShared {
    pub state: StateCell,
    pub counters: Counters,
    /// Set once the handshake failed; the agent stays `Disconnected` for the run
    pub failed: AtomicBool,
    timeline: Mutex<Timeline>,
}

impl AgentShared {
    pub(crate) fn new() -> Self {
        Self {
            state: StateCell::new(),
            counters: Counters::default(),
            failed: AtomicBool::new(false),
            timeline: Mutex::new(Timeline::default()),
        }
    }

    pub(crate) fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_connected(&self) {
        self.timeline().connect_time = Some(Utc::now());
        self.state.set(AgentState::Connected);
    }

    /// Record the end of the connection. Only the first call stamps the time.
    pub(crate) fn mark_disconnected(&self) {
        {
            let mut timeline = self.timeline();
            if timeline.connect_time.is_some() && timeline.disconnect_time.is_none() {
                timeline.disconnect_time = Some(Utc::now());
            }
        }
        self.state.set(AgentState::Disconnected);
    }

    pub(crate) fn mark_heartbeat(&self) {
        self.timeline().last_heartbeat = Some(Utc::now());
    }
}

/// Point-in-time snapshot of an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub agent_id: String,
    pub target_key: String,
    pub state: AgentState,
    pub failed: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors_sent: u64,
    pub errors_received: u64,
    pub heartbeats_sent: u64,
    /// Failed heartbeats; not part of the message counts
    pub heartbeat_errors: u64,
    pub connect_time: Option<DateTime<Utc>>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AgentStats {
    /// Time spent connected, up to now for a live agent
    pub fn uptime(&self) -> Duration {
        match self.connect_time {
            Some(start) => {
                let end = self.disconnect_time.unwrap_or_else(Utc::now);
                (end - start).to_std().unwrap_or_default()
            }
            None => Duration::ZERO,
        }
    }

    /// Every send attempt this agent made, successful or not
    pub fn send_attempts(&self) -> u64 {
        self.messages_sent + self.errors_sent
    }
}
