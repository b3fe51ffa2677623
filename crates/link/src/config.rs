//! Transport settings, deserialised from the `[transport]` table of each
//! binary's config file.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::Backoff;

/// MQTT protocol hard limit on a single payload.
const MQTT_MAX_PAYLOAD: usize = 268_435_455;

/// Largest PUBLISH framing around a payload: fixed header, a topic of up to
/// `u16::MAX` bytes with its length prefix, and a packet id.
const PUBLISH_OVERHEAD: usize = 5 + 2 + u16::MAX as usize + 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Empty means "let the binary pick one".
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,

    pub keepalive_ms: u64,
    pub liveness_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,

    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_publish_attempts: u32,
    /// A session that drops sooner than this counts as a failed attempt.
    pub stable_session_ms: u64,

    pub queue_capacity: usize,
    pub max_payload_bytes: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            keepalive_ms: 30_000,
            liveness_timeout_ms: 90_000,
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 5_000,
            backoff_base_ms: 1_000,
            backoff_ceiling_ms: 60_000,
            max_reconnect_attempts: 10,
            max_publish_attempts: 3,
            stable_session_ms: 10_000,
            queue_capacity: 100,
            max_payload_bytes: 4_096,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl TransportConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn stable_session(&self) -> Duration {
        Duration::from_millis(self.stable_session_ms)
    }

    /// Packet size limit handed to the MQTT client, in both directions.
    /// Large enough for any payload up to `max_payload_bytes`.
    pub fn max_packet_bytes(&self) -> usize {
        self.max_payload_bytes
            .saturating_add(PUBLISH_OVERHEAD)
            .min(MQTT_MAX_PAYLOAD + 5)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_ceiling_ms),
        )
    }

    /// Append every violation to `errors`, prefixed with `transport.`.
    pub fn validate_into(&self, errors: &mut Vec<String>) {
        if self.host.trim().is_empty() {
            errors.push("transport.host is empty".to_string());
        }
        if self.port == 0 {
            errors.push("transport.port must be non-zero".to_string());
        }

        let positive = [
            ("keepalive_ms", self.keepalive_ms),
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("publish_timeout_ms", self.publish_timeout_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_ceiling_ms", self.backoff_ceiling_ms),
            ("stable_session_ms", self.stable_session_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("transport.{name} must be positive"));
            }
        }

        if self.backoff_ceiling_ms < self.backoff_base_ms {
            errors.push(format!(
                "transport.backoff_ceiling_ms ({}) is below backoff_base_ms ({})",
                self.backoff_ceiling_ms, self.backoff_base_ms
            ));
        }
        if self.keepalive_ms > 0 && self.liveness_timeout_ms <= self.keepalive_ms {
            errors.push(format!(
                "transport.liveness_timeout_ms ({}) must exceed keepalive_ms ({})",
                self.liveness_timeout_ms, self.keepalive_ms
            ));
        }
        if self.max_reconnect_attempts == 0 {
            errors.push("transport.max_reconnect_attempts must be positive".to_string());
        }
        if self.max_publish_attempts == 0 {
            errors.push("transport.max_publish_attempts must be positive".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("transport.queue_capacity must be positive".to_string());
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > MQTT_MAX_PAYLOAD {
            errors.push(format!(
                "transport.max_payload_bytes {} out of range [1, {MQTT_MAX_PAYLOAD}]",
                self.max_payload_bytes
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            errors.push("transport.username and transport.password must be set together".to_string());
        }
    }
}
