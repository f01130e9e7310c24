//! Wire envelope exchanged with the server under test

pub mod messages;

pub use messages::{
    ClientEnvelope, ClientMessage, HeartbeatData, Inbound, RouteKey, ServerMessage, TestPayload,
    epoch_seconds,
};
