use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::state::{AgentError, AgentShared, AgentState, AgentStats, Counters};
use crate::config::AgentConfig;
use crate::protocol::{
    ClientEnvelope, ClientMessage, HeartbeatData, Inbound, RouteKey, ServerMessage, TestPayload,
};
use crate::transport::{FrameSink, FrameStream, Transport, TransportError};

type SharedSink = Arc<AsyncMutex<Option<Box<dyn FrameSink>>>>;

/// Background tasks owned by a connected agent
struct AgentTasks {
    receive: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// One simulated client holding one connection for the duration of a run.
///
/// All methods take `&self` so the agent can be shared (`Arc`) between the
/// connect phase, the pressure phase and teardown. Counters are atomics
/// written only by the agent's own send path and receive task.
///
/// `connect` holds `attempt` for its whole duration and `disconnect` takes it
/// too, so teardown never overlaps a handshake: it either waits for the
/// handshake to resolve or runs first and makes the later connect refuse.
pub struct ConnectionAgent {
    id: String,
    target_key: String,
    route: RouteKey,
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<AgentShared>,
    sink: SharedSink,
    tasks: Mutex<Option<AgentTasks>>,
    attempt: AsyncMutex<()>,
    closing: AtomicBool,
}

impl ConnectionAgent {
    pub fn new(
        id: impl Into<String>,
        target_key: impl Into<String>,
        route_key_field: &str,
        config: AgentConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let target_key = target_key.into();
        Self {
            id: id.into(),
            route: RouteKey {
                field: route_key_field.to_string(),
                value: target_key.clone(),
            },
            target_key,
            config,
            transport,
            shared: Arc::new(AgentShared::new()),
            sink: Arc::new(AsyncMutex::new(None)),
            tasks: Mutex::new(None),
            attempt: AsyncMutex::new(()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn state(&self) -> AgentState {
        self.shared.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == AgentState::Connected
    }

    /// Open the agent's connection, bounded by `timeout`.
    ///
    /// Returns the handshake duration on success. Never retries: an agent
    /// connects at most once per run, a second call fails with
    /// [`AgentError::AlreadyUsed`], and a call after [`disconnect`] fails
    /// with [`AgentError::Closed`].
    ///
    /// [`disconnect`]: Self::disconnect
    pub async fn connect(&self, timeout: Duration) -> Result<Duration, AgentError> {
        let _attempt = self.attempt.lock().await;

        let used = self.shared.failed.load(Ordering::Acquire)
            || self.shared.timeline().connect_time.is_some();
        if used {
            return Err(AgentError::AlreadyUsed(self.id.clone()));
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(AgentError::Closed(self.id.clone()));
        }
        if !self
            .shared
            .state
            .transition(AgentState::Disconnected, AgentState::Connecting)
        {
            return Err(AgentError::AlreadyUsed(self.id.clone()));
        }

        let start = Instant::now();
        let opened = tokio::time::timeout(timeout, self.transport.open(&self.target_key)).await;
        let elapsed = start.elapsed();

        let connection = match opened {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(self.fail_connect(e)),
            Err(_) => {
                let e = TransportError::ConnectTimeout(timeout.as_millis() as u64);
                return Err(self.fail_connect(e));
            }
        };

        *self.sink.lock().await = Some(connection.sink);
        self.shared.mark_connected();

        let (idle_tx, idle_rx) = mpsc::channel(1);
        let receive = tokio::spawn(receive_loop(
            self.id.clone(),
            connection.stream,
            Arc::clone(&self.shared),
            self.config.idle_timeout,
            idle_tx,
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.id.clone(),
            self.route.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.shared),
            self.config.heartbeat_interval,
            idle_rx,
        ));
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(AgentTasks { receive, heartbeat });

        debug!(agent = %self.id, target = %self.target_key, ?elapsed, "Agent connected");
        Ok(elapsed)
    }

    fn fail_connect(&self, error: TransportError) -> AgentError {
        self.shared.failed.store(true, Ordering::Release);
        self.shared.state.set(AgentState::Disconnected);
        debug!(agent = %self.id, target = %self.target_key, %error, "Agent failed to connect");
        AgentError::Transport(error)
    }

    /// Send one message. Fails closed: returns `false` and counts an error if
    /// the agent is not connected or the transport rejects the frame.
    pub async fn send(&self, message: ClientMessage) -> bool {
        if !self.is_connected() {
            Counters::bump(&self.shared.counters.errors_sent);
            return false;
        }

        let envelope = ClientEnvelope::new(message, self.route.clone());
        match send_envelope(&self.sink, &envelope).await {
            Ok(()) => {
                Counters::bump(&self.shared.counters.messages_sent);
                metrics::counter!("ws_loadtest_messages_sent_total").increment(1);
                true
            }
            Err(e) => {
                Counters::bump(&self.shared.counters.errors_sent);
                metrics::counter!("ws_loadtest_messages_failed_total").increment(1);
                trace!(agent = %self.id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send a `test_message` carrying the configured filler payload
    pub async fn send_test_message(&self) -> bool {
        let message = ClientMessage::TestMessage {
            data: TestPayload::filler(&self.id, self.config.payload_bytes),
        };
        self.send(message).await
    }

    /// Close the connection and join the background tasks.
    ///
    /// A handshake still in flight is waited for (at most its connect
    /// timeout) and then closed like any other connection. Once this has run,
    /// the agent never connects again.
    ///
    /// Idempotent: returns `true` only for the call that actually tore the
    /// connection down; later calls (or calls on a never-connected agent) are no-ops.
    pub async fn disconnect(&self) -> bool {
        self.closing.store(true, Ordering::Release);
        let _attempt = self.attempt.lock().await;

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let sink = self.sink.lock().await.take();
        if tasks.is_none() && sink.is_none() {
            // A connect future dropped mid-handshake leaves the agent Connecting
            if self
                .shared
                .state
                .transition(AgentState::Connecting, AgentState::Disconnected)
            {
                self.shared.failed.store(true, Ordering::Release);
                debug!(agent = %self.id, "Abandoned handshake reset");
            }
            return false;
        }

        self.shared
            .state
            .transition(AgentState::Connected, AgentState::Disconnecting);

        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            trace!(agent = %self.id, error = %e, "Close handshake failed");
        }

        if let Some(tasks) = tasks {
            tasks.receive.abort();
            tasks.heartbeat.abort();
            let _ = tasks.receive.await;
            let _ = tasks.heartbeat.await;
        }

        self.shared.mark_disconnected();
        debug!(agent = %self.id, "Agent disconnected");
        true
    }

    /// Point-in-time snapshot; safe to call while sends and receives are in flight
    pub fn stats(&self) -> AgentStats {
        let counters = &self.shared.counters;
        let timeline = self.shared.timeline().clone();
        AgentStats {
            agent_id: self.id.clone(),
            target_key: self.target_key.clone(),
            state: self.state(),
            failed: self.shared.failed.load(Ordering::Acquire),
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            errors_sent: counters.errors_sent.load(Ordering::Relaxed),
            errors_received: counters.errors_received.load(Ordering::Relaxed),
            heartbeats_sent: counters.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_errors: counters.heartbeat_errors.load(Ordering::Relaxed),
            connect_time: timeline.connect_time,
            disconnect_time: timeline.disconnect_time,
            last_heartbeat: timeline.last_heartbeat,
        }
    }
}

async fn send_envelope(sink: &SharedSink, envelope: &ClientEnvelope) -> Result<(), AgentError> {
    let json = envelope
        .to_json()
        .map_err(|e| TransportError::Send(e.to_string()))?;
    let mut guard = sink.lock().await;
    let sink = guard.as_mut().ok_or(AgentError::NotConnected)?;
    sink.send_text(json).await?;
    Ok(())
}

/// Consume inbound frames until the peer closes or the stream errors.
/// Inbound silence longer than `idle_timeout` wakes the heartbeat task.
async fn receive_loop(
    agent_id: String,
    mut stream: Box<dyn FrameStream>,
    shared: Arc<AgentShared>,
    idle_timeout: Duration,
    idle_tx: mpsc::Sender<()>,
) {
    loop {
        match tokio::time::timeout(idle_timeout, stream.recv()).await {
            Ok(Some(Ok(text))) => {
                Counters::bump(&shared.counters.messages_received);
                metrics::counter!("ws_loadtest_messages_received_total").increment(1);
                match ServerMessage::decode(&text) {
                    Inbound::Message(ServerMessage::Error { message }) => {
                        debug!(agent = %agent_id, %message, "Server reported error");
                    }
                    Inbound::Message(msg) => {
                        trace!(agent = %agent_id, kind = msg.message_type(), "Inbound message");
                    }
                    Inbound::Malformed(reason) => {
                        trace!(agent = %agent_id, %reason, "Undecodable inbound frame");
                    }
                }
            }
            Ok(Some(Err(e))) => {
                Counters::bump(&shared.counters.errors_received);
                debug!(agent = %agent_id, error = %e, "Receive failed");
                break;
            }
            Ok(None) => {
                debug!(agent = %agent_id, "Peer closed connection");
                break;
            }
            Err(_) => {
                // Idle: ask for a heartbeat, never treat silence as failure
                let _ = idle_tx.try_send(());
            }
        }
    }

    // Peer-side close while we still considered ourselves connected
    if shared
        .state
        .transition(AgentState::Connected, AgentState::Disconnecting)
    {
        shared.mark_disconnected();
    }
}

/// Emit a heartbeat each time the receive loop reports idleness, at most
/// once per `heartbeat_interval`.
async fn heartbeat_loop(
    agent_id: String,
    route: RouteKey,
    sink: SharedSink,
    shared: Arc<AgentShared>,
    heartbeat_interval: Duration,
    mut idle_rx: mpsc::Receiver<()>,
) {
    let mut last_heartbeat = Instant::now();

    while idle_rx.recv().await.is_some() {
        if shared.state.get() != AgentState::Connected {
            break;
        }
        if last_heartbeat.elapsed() < heartbeat_interval {
            continue;
        }

        let envelope = ClientEnvelope::new(
            ClientMessage::Heartbeat {
                data: HeartbeatData {
                    client_id: agent_id.clone(),
                },
            },
            route.clone(),
        );
        match send_envelope(&sink, &envelope).await {
            Ok(()) => {
                last_heartbeat = Instant::now();
                Counters::bump(&shared.counters.heartbeats_sent);
                shared.mark_heartbeat();
                trace!(agent = %agent_id, "Heartbeat sent");
            }
            Err(e) => {
                Counters::bump(&shared.counters.heartbeat_errors);
                warn!(agent = %agent_id, error = %e, "Heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBehavior, MockTransport};
    use serde_json::Value;

    fn agent_config() -> AgentConfig {
        AgentConfig {
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            payload_bytes: 16,
        }
    }

    fn agent(transport: &Arc<MockTransport>, target: &str) -> ConnectionAgent {
        ConnectionAgent::new(
            "perf_test_client_0000",
            target,
            "activation_code",
            agent_config(),
            Arc::clone(transport) as Arc<dyn Transport>,
        )
    }

    #[tokio::test]
    async fn test_connect_send_disconnect() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");

        assert_eq!(agent.state(), AgentState::Disconnected);
        agent.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(agent.state(), AgentState::Connected);

        assert!(agent.send_test_message().await);
        assert!(agent.send_test_message().await);

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 2);
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["type"], "test_message");
        assert_eq!(frame["activation_code"], "G1");
        assert_eq!(frame["data"]["payload"].as_str().unwrap().len(), 16);

        assert!(agent.disconnect().await);
        let stats = agent.stats();
        assert_eq!(stats.state, AgentState::Disconnected);
        assert_eq!(stats.messages_sent, 2);
        assert!(stats.connect_time.is_some());
        assert!(stats.disconnect_time.is_some());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = Arc::new(MockTransport::new());
        transport.set_behavior("bad", MockBehavior::Refuse);
        let agent = agent(&transport, "bad");

        let err = agent.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Transport(TransportError::Connect(_))
        ));
        assert_eq!(agent.state(), AgentState::Disconnected);
        assert!(agent.stats().failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = Arc::new(MockTransport::new());
        transport.set_behavior("slow", MockBehavior::Hang);
        let agent = agent(&transport, "slow");

        let err = agent.connect(Duration::from_secs(10)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(agent.state(), AgentState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");
        agent.connect(Duration::from_secs(1)).await.unwrap();
        agent.disconnect().await;

        let err = agent.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyUsed(_)));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_send_fails_closed_when_not_connected() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");

        assert!(!agent.send_test_message().await);
        let stats = agent.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.errors_sent, 1);
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_send_transport_error_counted() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");
        agent.connect(Duration::from_secs(1)).await.unwrap();

        transport.fail_sends(true);
        assert!(!agent.send_test_message().await);
        transport.fail_sends(false);
        assert!(agent.send_test_message().await);

        let stats = agent.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.errors_sent, 1);
        agent.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");

        // Never connected
        assert!(!agent.disconnect().await);

        agent.connect(Duration::from_secs(1)).await.unwrap();
        assert!(agent.disconnect().await);
        let first = agent.stats();
        assert!(!agent.disconnect().await);
        let second = agent.stats();

        assert_eq!(first.disconnect_time, second.disconnect_time);
        assert_eq!(second.state, AgentState::Disconnected);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_receive_loop_counts_inbound() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");
        agent.connect(Duration::from_secs(1)).await.unwrap();

        transport.push_inbound(r#"{"type":"stats_update","data":{}}"#);
        transport.push_inbound(r#"{"type":"heartbeat_ack","data":{"status":"ok"}}"#);
        transport.push_inbound("garbage");

        tokio::time::timeout(Duration::from_secs(1), async {
            while agent.stats().messages_received < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        agent.disconnect().await;
    }

    #[tokio::test]
    async fn test_peer_close_marks_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.set_behavior("flaky", MockBehavior::AcceptThenClose);
        let agent = agent(&transport, "flaky");
        agent.connect(Duration::from_secs(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while agent.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(agent.state(), AgentState::Disconnected);
        assert!(!agent.send_test_message().await);
        // Teardown still joins the finished tasks exactly once
        assert!(agent.disconnect().await);
        assert!(!agent.disconnect().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_emits_heartbeat() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");
        agent.connect(Duration::from_secs(1)).await.unwrap();

        // One idle window: the receive loop times out and wakes the heartbeat task
        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = agent.stats();
        assert_eq!(stats.heartbeats_sent, 1);
        assert!(stats.last_heartbeat.is_some());
        assert_eq!(stats.state, AgentState::Connected);

        let frames = transport.sent_frames();
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "heartbeat");
        assert_eq!(frame["activation_code"], "G1");

        agent.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_heartbeat_is_not_a_failed_send() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");
        agent.connect(Duration::from_secs(1)).await.unwrap();

        transport.fail_sends(true);
        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = agent.stats();
        assert_eq!(stats.heartbeat_errors, 1);
        assert_eq!(stats.heartbeats_sent, 0);
        assert_eq!(stats.errors_sent, 0);
        assert_eq!(stats.send_attempts(), 0);

        agent.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_waits_for_inflight_handshake() {
        let transport = Arc::new(MockTransport::new());
        transport.set_behavior("G1", MockBehavior::Delay(Duration::from_secs(1)));
        let agent = Arc::new(agent(&transport, "G1"));

        let connecting = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.connect(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.state(), AgentState::Connecting);

        // Resolves only once the handshake has landed, then closes it
        assert!(agent.disconnect().await);
        assert!(connecting.await.unwrap().is_ok());
        assert_eq!(agent.state(), AgentState::Disconnected);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_handshake_ends_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.set_behavior("slow", MockBehavior::Hang);
        let agent = Arc::new(agent(&transport, "slow"));

        let connecting = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.connect(Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(agent.state(), AgentState::Connecting);

        connecting.abort();
        assert!(connecting.await.unwrap_err().is_cancelled());

        assert!(!agent.disconnect().await);
        assert_eq!(agent.state(), AgentState::Disconnected);
        assert!(agent.stats().failed);
        assert_eq!(transport.close_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_is_refused() {
        let transport = Arc::new(MockTransport::new());
        let agent = agent(&transport, "G1");

        assert!(!agent.disconnect().await);
        let err = agent.connect(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, AgentError::Closed(agent.id().to_string()));
        assert_eq!(agent.state(), AgentState::Disconnected);
        assert_eq!(transport.open_count(), 0);
    }
}
