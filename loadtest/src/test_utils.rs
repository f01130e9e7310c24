//! Test Utilities Module
//!
//! In-memory stand-ins for the harness's external seams: the transport, the
//! fixture collaborator and process discovery.
//! This module is only compiled when running tests.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Credentials;
use crate::fixture::{FixtureError, FixtureService, Target, TargetPage, TargetSpec};
use crate::monitor::{MonitorError, ProcessHandle, ProcessInfo, ProcessLocator};
use crate::transport::{Connection, FrameSink, FrameStream, Transport, TransportError};

// ============================================================================
// Transport
// ============================================================================

/// How the mock transport answers an open for a given target key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Accept,
    Refuse,
    /// Never completes the handshake
    Hang,
    /// Completes the handshake, then the peer closes straight away
    AcceptThenClose,
    /// Accepts after an async wait
    Delay(Duration),
    /// Accepts after blocking the polling thread, so the whole handshake
    /// happens inside a single poll
    Stall(Duration),
}

#[derive(Default)]
struct TransportState {
    behaviors: HashMap<String, MockBehavior>,
    sent: Vec<String>,
    fail_sends: bool,
    opens: usize,
    closes: usize,
    peers: Vec<mpsc::UnboundedSender<String>>,
}

/// Transport that records outbound frames and lets tests inject inbound ones
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, target_key: &str, behavior: MockBehavior) {
        self.state()
            .behaviors
            .insert(target_key.to_string(), behavior);
    }

    /// Make every send fail until switched back
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Accepted connections
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Connections closed from the client side
    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    /// Deliver `text` to every open connection
    pub fn push_inbound(&self, text: &str) {
        self.state()
            .peers
            .retain(|peer| peer.send(text.to_string()).is_ok());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, target_key: &str) -> Result<Connection, TransportError> {
        let behavior = self
            .state()
            .behaviors
            .get(target_key)
            .copied()
            .unwrap_or(MockBehavior::Accept);

        match behavior {
            MockBehavior::Refuse => Err(TransportError::Connect(format!(
                "connection refused for {}",
                target_key
            ))),
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept(true))
            }
            MockBehavior::Stall(stall) => {
                std::thread::sleep(stall);
                Ok(self.accept(true))
            }
            MockBehavior::Accept => Ok(self.accept(true)),
            MockBehavior::AcceptThenClose => Ok(self.accept(false)),
        }
    }
}

impl MockTransport {
    /// Open a connection; without a live peer its stream ends immediately
    fn accept(&self, keep_peer: bool) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state.opens += 1;
            if keep_peer {
                state.peers.push(tx);
            }
        }
        Connection {
            sink: Box::new(MockSink {
                state: Arc::clone(&self.state),
                closed: false,
            }),
            stream: Box::new(MockStream { rx }),
        }
    }
}

struct MockSink {
    state: Arc<Mutex<TransportState>>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_sends {
            return Err(TransportError::Send("injected failure".to_string()));
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .closes += 1;
        }
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

// ============================================================================
// Fixture collaborator
// ============================================================================

/// In-memory target store with call counters and failure switches
#[derive(Default)]
pub struct MockFixtureService {
    targets: Mutex<Vec<Target>>,
    next_key: AtomicUsize,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
    create_budget: Mutex<Option<usize>>,
    reject_login: AtomicBool,
}

impl MockFixtureService {
    /// Key the service assigns to the `n`-th target (1-based)
    pub fn key_for(n: usize) -> String {
        format!("CODE{:04}", n)
    }

    /// `n` targets with remarks `{prefix}1..={prefix}n`
    pub fn with_targets(n: usize, prefix: &str) -> Self {
        let service = Self::default();
        for i in 1..=n {
            service.add_target(&Self::key_for(i), &format!("{}{}", prefix, i));
        }
        service
    }

    pub fn add_target(&self, key: &str, remark: &str) {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let id = targets.len() as u64 + 1;
        targets.push(Target {
            id: Some(id),
            key: key.to_string(),
            remark: remark.to_string(),
            is_active: true,
        });
        self.next_key.fetch_add(1, Ordering::SeqCst);
    }

    /// Creates succeed `n` more times, then fail
    pub fn fail_creates_after(&self, n: usize) {
        *self.create_budget.lock().unwrap_or_else(PoisonError::into_inner) = Some(n);
    }

    pub fn reject_login(&self) {
        self.reject_login.store(true, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FixtureService for MockFixtureService {
    async fn login(&self, credentials: &Credentials) -> Result<String, FixtureError> {
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(FixtureError::Auth(format!(
                "invalid credentials for {}",
                credentials.username
            )));
        }
        Ok("mock-token".to_string())
    }

    async fn list_targets(
        &self,
        _token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TargetPage, FixtureError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let start = (page.saturating_sub(1) * page_size) as usize;
        let list = targets
            .iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect();
        Ok(TargetPage {
            list,
            total: targets.len() as u64,
        })
    }

    async fn create_target(&self, _token: &str, spec: &TargetSpec) -> Result<Target, FixtureError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut budget = self.create_budget.lock().unwrap_or_else(PoisonError::into_inner);
            match budget.as_mut() {
                Some(0) => return Err(FixtureError::Create("quota exceeded".to_string())),
                Some(left) => *left -= 1,
                None => {}
            }
        }

        let n = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let target = Target {
            id: Some(targets.len() as u64 + 1),
            key: Self::key_for(n),
            remark: spec.remark.clone(),
            is_active: spec.is_active,
        };
        targets.push(target.clone());
        Ok(target)
    }
}

// ============================================================================
// Process discovery
// ============================================================================

/// A fake process with a scripted sequence of memory readings
#[derive(Debug, Clone)]
pub struct MockProcess {
    pid: u32,
    name: String,
    readings: Vec<u64>,
    exits: bool,
}

impl MockProcess {
    /// After the last reading the process keeps reporting it
    pub fn new(pid: u32, name: &str, readings: Vec<u64>) -> Self {
        Self {
            pid,
            name: name.to_string(),
            readings,
            exits: false,
        }
    }

    /// The process disappears once its readings are used up
    pub fn exit_after_readings(mut self) -> Self {
        self.exits = true;
        self
    }
}

pub struct MockLocator {
    processes: Vec<MockProcess>,
}

impl MockLocator {
    pub fn new(processes: Vec<MockProcess>) -> Self {
        Self { processes }
    }
}

impl ProcessLocator for MockLocator {
    fn find(&self, predicate: &dyn Fn(&ProcessInfo) -> bool) -> Option<Box<dyn ProcessHandle>> {
        self.processes
            .iter()
            .find(|p| {
                predicate(&ProcessInfo {
                    pid: p.pid,
                    name: p.name.clone(),
                    cmdline: p.name.clone(),
                })
            })
            .map(|p| {
                Box::new(MockHandle {
                    process: p.clone(),
                    next: 0,
                }) as Box<dyn ProcessHandle>
            })
    }
}

struct MockHandle {
    process: MockProcess,
    next: usize,
}

impl ProcessHandle for MockHandle {
    fn pid(&self) -> u32 {
        self.process.pid
    }

    fn name(&self) -> &str {
        &self.process.name
    }

    fn resident_bytes(&mut self) -> Result<u64, MonitorError> {
        if let Some(bytes) = self.process.readings.get(self.next) {
            self.next += 1;
            return Ok(*bytes);
        }
        if self.process.exits {
            return Err(MonitorError::ProcessGone(self.process.pid));
        }
        Ok(self.process.readings.last().copied().unwrap_or(0))
    }
}
