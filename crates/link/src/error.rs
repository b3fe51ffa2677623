//! Error type for the transport layer.
//!
//! Variants fall into three groups that callers handle differently:
//! synchronous rejections (bad payload, backpressure), lifecycle errors
//! (shut down, gave up), and transient connection failures that the driver
//! retries on its own and only ever reports through logs and state.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    // Rejected synchronously, never queued.
    /// Payload is larger than `max_payload_bytes`.
    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload has a byte outside printable ASCII (`0x20..=0x7E` plus tab,
    /// CR and LF). `offset` is the first such byte, so any multi-byte UTF-8
    /// character is rejected at its lead byte.
    #[error("payload failed printable-text check at byte {offset}")]
    PayloadNotPrintable { offset: usize },

    /// Topic is empty or contains wildcard characters.
    #[error("invalid publish topic '{0}'")]
    InvalidTopic(String),

    /// The outbound queue is full. The caller should retry later.
    #[error("outbound queue full ({capacity} messages)")]
    Backpressure { capacity: usize },

    // Lifecycle.
    /// The transport was shut down; no further publishes are accepted.
    #[error("transport is shut down")]
    ShutDown,

    /// The reconnect budget is exhausted. The client must be rebuilt.
    #[error("gave up after {attempts} failed connection attempts")]
    GaveUp { attempts: u32 },

    // Transient, retried by the driver.
    #[error("connect attempt timed out")]
    ConnectTimeout,

    #[error("connection error: {0}")]
    Connection(String),
}

impl TransportError {
    /// True for errors the driver recovers from through backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::Connection(_))
    }
}

impl From<rumqttc::ConnectionError> for TransportError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Self::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::ConnectTimeout.is_transient());
        assert!(TransportError::Connection("reset".into()).is_transient());
        assert!(!TransportError::Backpressure { capacity: 10 }.is_transient());
        assert!(!TransportError::GaveUp { attempts: 5 }.is_transient());
        assert!(!TransportError::PayloadTooLarge { size: 10, max: 5 }.is_transient());
    }

    #[test]
    fn backpressure_message_names_capacity() {
        let msg = TransportError::Backpressure { capacity: 10 }.to_string();
        assert!(msg.contains("10"), "got: {msg}");
    }
}
