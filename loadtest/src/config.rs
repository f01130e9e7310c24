//! Harness configuration
//!
//! Configuration is loaded from environment variables prefixed with `LOADTEST_`.
//! Every value has a default; unparseable values are ignored.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main harness configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the server under test
    pub ws_url: String,
    /// REST base URL of the fixture collaborator
    pub api_base_url: String,
    /// Name of the routing field (query parameter and envelope field)
    pub route_key_field: String,
    /// Collaborator login
    pub credentials: Credentials,

    /// Fixture provisioning
    pub fixture: FixtureConfig,
    /// Per-agent behaviour
    pub agent: AgentConfig,
    /// Connection phase
    pub connections: ConnectionConfig,
    /// Pressure phase
    pub pressure: PressureConfig,
    /// Memory monitoring
    pub monitor: MonitorConfig,
    /// Overall verdict thresholds
    pub verdict: VerdictThresholds,

    /// Proceed to the pressure phase when fewer agents connected than requested
    pub continue_on_shortfall: bool,
    /// Upper bound on the connection + pressure + monitoring phases
    pub run_timeout: Option<Duration>,
    /// Directory receiving the report artifacts
    pub output_dir: PathBuf,
    /// Bind address for the Prometheus scrape endpoint
    pub metrics_addr: Option<String>,
}

/// Collaborator credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Fixture (target key) provisioning
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Number of targets to spread the agents across
    pub target_count: usize,
    /// Remark prefix identifying targets owned by the harness
    pub remark_prefix: String,
    /// Maximum number of create calls when topping up
    pub max_create_attempts: usize,
    /// Page size used when listing targets
    pub page_size: u32,
}

/// Per-agent behaviour
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Inbound silence after which a heartbeat is emitted
    pub idle_timeout: Duration,
    /// Minimum spacing between two heartbeats
    pub heartbeat_interval: Duration,
    /// Filler size of a pressure message payload
    pub payload_bytes: usize,
}

/// Connection phase
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Number of agents
    pub total: usize,
    /// Connect attempts issued concurrently per batch
    pub batch_size: usize,
    /// Pause between two batches
    pub batch_pause: Duration,
    /// Handshake bound per attempt
    pub connect_timeout: Duration,
    /// Wait after the last batch before counting stable connections
    pub settle_interval: Duration,
}

/// Pressure phase
#[derive(Debug, Clone)]
pub struct PressureConfig {
    /// Wall-clock length of the phase
    pub duration: Duration,
    /// Sleep between two sends of one agent
    pub message_interval: Duration,
    /// Abandon in-flight sends at the deadline instead of letting them finish
    pub hard_deadline: bool,
}

/// Memory monitoring
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Case-insensitive substring matched against process name and command line
    pub process_pattern: String,
    /// Sampling interval
    pub interval: Duration,
    /// Extra observation time after the pressure phase
    pub grace_period: Duration,
    /// Growth ratio (percent) above which a run is flagged as a possible leak
    pub leak_threshold_pct: f64,
    /// Readings averaged into the baseline before the pressure phase; 0 disables it
    pub baseline_samples: usize,
    /// Spacing between two baseline readings
    pub baseline_interval: Duration,
}

/// Thresholds for the overall qualitative verdict
#[derive(Debug, Clone, PartialEq)]
pub struct VerdictThresholds {
    /// Minimum connect and send success rates (percent) for "excellent"
    pub excellent_rate: f64,
    /// Minimum connect and send success rates (percent) for "good"
    pub good_rate: f64,
    /// Maximum absolute memory growth in MiB for "excellent"
    pub memory_growth_limit_mb: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/api/ws/client".to_string(),
            api_base_url: "http://localhost:8080/api/v1".to_string(),
            route_key_field: "activation_code".to_string(),
            credentials: Credentials::default(),
            fixture: FixtureConfig::default(),
            agent: AgentConfig::default(),
            connections: ConnectionConfig::default(),
            pressure: PressureConfig::default(),
            monitor: MonitorConfig::default(),
            verdict: VerdictThresholds::default(),
            continue_on_shortfall: true,
            run_timeout: None,
            output_dir: PathBuf::from("."),
            metrics_addr: None,
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin123".to_string(),
        }
    }
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            target_count: 100,
            remark_prefix: "perf-test-group".to_string(),
            max_create_attempts: 200,
            page_size: 100,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            payload_bytes: 100,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            total: 800,
            batch_size: 100,
            batch_pause: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            settle_interval: Duration::from_secs(10),
        }
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            message_interval: Duration::from_millis(10),
            hard_deadline: false,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            process_pattern: "server".to_string(),
            interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(60),
            leak_threshold_pct: 20.0,
            baseline_samples: 5,
            baseline_interval: Duration::from_secs(1),
        }
    }
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            excellent_rate: 95.0,
            good_rate: 90.0,
            memory_growth_limit_mb: 50.0,
        }
    }
}

fn parse_flag(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Endpoints
        if let Some(url) = lookup("LOADTEST_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("LOADTEST_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(field) = lookup("LOADTEST_ROUTE_KEY_FIELD")
            && !field.is_empty()
        {
            config.route_key_field = field;
        }
        if let Some(user) = lookup("LOADTEST_USERNAME") {
            config.credentials.username = user;
        }
        if let Some(pass) = lookup("LOADTEST_PASSWORD") {
            config.credentials.password = pass;
        }

        // Fixture config
        if let Some(val) = lookup("LOADTEST_TARGETS")
            && let Ok(v) = val.parse()
        {
            config.fixture.target_count = v;
        }
        if let Some(prefix) = lookup("LOADTEST_TARGET_REMARK_PREFIX")
            && !prefix.is_empty()
        {
            config.fixture.remark_prefix = prefix;
        }
        if let Some(val) = lookup("LOADTEST_TARGET_CREATE_ATTEMPTS")
            && let Ok(v) = val.parse()
        {
            config.fixture.max_create_attempts = v;
        }
        if let Some(val) = lookup("LOADTEST_PAGE_SIZE")
            && let Ok(v) = val.parse::<u32>()
            && v > 0
        {
            config.fixture.page_size = v;
        }

        // Agent config
        if let Some(val) = lookup("LOADTEST_IDLE_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.agent.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("LOADTEST_HEARTBEAT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.agent.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("LOADTEST_PAYLOAD_BYTES")
            && let Ok(v) = val.parse()
        {
            config.agent.payload_bytes = v;
        }

        // Connection config
        if let Some(val) = lookup("LOADTEST_CONNECTIONS")
            && let Ok(v) = val.parse()
        {
            config.connections.total = v;
        }
        if let Some(val) = lookup("LOADTEST_BATCH_SIZE")
            && let Ok(v) = val.parse::<usize>()
            && v > 0
        {
            config.connections.batch_size = v;
        }
        if let Some(val) = lookup("LOADTEST_BATCH_PAUSE_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.connections.batch_pause = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("LOADTEST_CONNECT_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.connections.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("LOADTEST_SETTLE_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.connections.settle_interval = Duration::from_secs(secs);
        }

        // Pressure config
        if let Some(val) = lookup("LOADTEST_DURATION_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.pressure.duration = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("LOADTEST_MESSAGE_INTERVAL_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.pressure.message_interval = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("LOADTEST_HARD_DEADLINE") {
            config.pressure.hard_deadline = parse_flag(&val);
        }

        // Monitor config
        if let Some(pattern) = lookup("LOADTEST_PROCESS_PATTERN")
            && !pattern.is_empty()
        {
            config.monitor.process_pattern = pattern;
        }
        if let Some(val) = lookup("LOADTEST_MEMORY_INTERVAL_SECS")
            && let Ok(secs) = val.parse::<u64>()
            && secs > 0
        {
            config.monitor.interval = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("LOADTEST_MEMORY_GRACE_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.monitor.grace_period = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("LOADTEST_LEAK_THRESHOLD_PCT")
            && let Ok(pct) = val.parse()
        {
            config.monitor.leak_threshold_pct = pct;
        }
        if let Some(val) = lookup("LOADTEST_MEMORY_BASELINE_SAMPLES")
            && let Ok(v) = val.parse()
        {
            config.monitor.baseline_samples = v;
        }
        if let Some(val) = lookup("LOADTEST_MEMORY_BASELINE_INTERVAL_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.monitor.baseline_interval = Duration::from_millis(ms);
        }

        // Verdict thresholds
        if let Some(val) = lookup("LOADTEST_EXCELLENT_PCT")
            && let Ok(pct) = val.parse()
        {
            config.verdict.excellent_rate = pct;
        }
        if let Some(val) = lookup("LOADTEST_GOOD_PCT")
            && let Ok(pct) = val.parse()
        {
            config.verdict.good_rate = pct;
        }
        if let Some(val) = lookup("LOADTEST_MEMORY_GROWTH_LIMIT_MB")
            && let Ok(mb) = val.parse()
        {
            config.verdict.memory_growth_limit_mb = mb;
        }

        // Run control
        if let Some(val) = lookup("LOADTEST_CONTINUE_ON_SHORTFALL") {
            config.continue_on_shortfall = parse_flag(&val);
        }
        if let Some(val) = lookup("LOADTEST_RUN_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
            && secs > 0
        {
            config.run_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(dir) = lookup("LOADTEST_OUTPUT_DIR")
            && !dir.is_empty()
        {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("LOADTEST_METRICS_ADDR")
            && !addr.is_empty()
        {
            config.metrics_addr = Some(addr);
        }

        config
    }
}
