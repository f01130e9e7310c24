//! Load phases driven over a pool of agents

pub mod batch;
pub mod pressure;
pub mod stats;

pub use batch::{BatchConnector, BatchSummary, ConnectionAttemptResult, ConnectionSummary};
pub use pressure::{PressureDriver, PressureResult};
pub use stats::{DurationStats, DurationSummary, percent};
