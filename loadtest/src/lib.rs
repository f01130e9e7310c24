//! WebSocket Load-Test Harness Library
//!
//! Opens many concurrent WebSocket client connections against a server,
//! drives message traffic through them, samples the server process's memory
//! meanwhile, and produces a structured report.
//!
//! The entry point is [`LoadTestOrchestrator`]; the binary wires it to the
//! real WebSocket transport, the HTTP fixture collaborator and `sysinfo`.

pub mod agent;
pub mod config;
pub mod fixture;
pub mod load;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use agent::{AgentError, AgentState, AgentStats, ConnectionAgent};
pub use config::Config;
pub use fixture::{FixtureService, HttpFixtureService};
pub use load::{BatchConnector, ConnectionSummary, PressureDriver, PressureResult};
pub use monitor::{MemoryStats, ResourceMonitor, SysinfoLocator};
pub use orchestrator::{LoadTestOrchestrator, RunError, TestReport, Verdict};
pub use protocol::{ClientEnvelope, ClientMessage, ServerMessage};
pub use transport::{Transport, WsTransport};
