//! Shared MQTT plumbing for the presence node and hub: a reconnecting
//! transport with a bounded outbound queue, the presence event wire format,
//! and the `presence/...` topic layout.

mod backoff;
mod config;
mod connection;
mod error;
mod event;
mod identity;
mod outbound;
mod payload;
pub mod topic;
mod transport;

pub use backoff::Backoff;
pub use config::TransportConfig;
pub use connection::{ConnectionLabel, ConnectionMachine, ConnectionState, Liveness};
pub use error::TransportError;
pub use event::{now_epoch_ms, status_token, PresenceEvent};
pub use identity::{Identity, InvalidIdentity};
pub use payload::validate_payload;
pub use transport::{Handler, ShutdownReport, Transport, TransportDriver, TransportStats};

pub use rumqttc::QoS;
