//! Event publishing with fan-out to legacy topics.
//!
//! Every event goes out once on its structured topic. When that publish is
//! accepted, each entry in the mirror table is rendered and published in
//! the same call. A mirror that fails is logged and left alone; it never
//! affects the primary and is never retried on its own.

use presence_link::topic::status_topic;
use presence_link::{PresenceEvent, QoS, Transport, TransportError};
use tracing::{debug, warn};

/// One legacy format: where to publish and what to send.
#[derive(Clone, Copy)]
pub struct Mirror {
    /// Topic with `{subject}` standing in for the subject id.
    pub topic_template: &'static str,
    pub payload: fn(&PresenceEvent) -> Vec<u8>,
    pub qos: QoS,
}

impl Mirror {
    pub fn topic(&self, subject_id: &str) -> String {
        self.topic_template.replace("{subject}", subject_id)
    }
}

fn status_token_payload(event: &PresenceEvent) -> Vec<u8> {
    event.status_token().as_bytes().to_vec()
}

/// Formats older consumers still read.
pub const LEGACY_MIRRORS: &[Mirror] = &[Mirror {
    topic_template: "presence/{subject}/status.legacy",
    payload: status_token_payload,
    qos: QoS::AtMostOnce,
}];

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct EventPublisher {
    transport: Transport,
    mirrors: &'static [Mirror],
}

impl EventPublisher {
    pub fn new(transport: Transport, mirrors: &'static [Mirror]) -> Self {
        Self { transport, mirrors }
    }

    /// Publish `event` on its status topic, then on every mirror. Returns
    /// the primary publish result only.
    pub fn publish(&self, event: &PresenceEvent) -> Result<(), PublishError> {
        let payload = event.to_json()?;
        let topic = status_topic(&event.subject_id);
        self.transport.publish(&topic, payload, QoS::AtLeastOnce, false)?;
        debug!(%topic, present = event.present, "event queued");

        for mirror in self.mirrors {
            let topic = mirror.topic(&event.subject_id);
            if let Err(e) = self.transport.publish(&topic, (mirror.payload)(event), mirror.qos, false) {
                warn!(%topic, error = %e, "legacy mirror publish failed");
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use presence_link::topic::legacy_status_topic;
    use presence_link::TransportConfig;

    fn transport(capacity: usize) -> (Transport, presence_link::TransportDriver) {
        Transport::new(TransportConfig {
            client_id: "legacy-test".into(),
            queue_capacity: capacity,
            ..TransportConfig::default()
        })
    }

    fn event(present: bool) -> PresenceEvent {
        PresenceEvent::new("3", present, "AA:BB:CC:DD:EE:FF", 1_700_000_000_000)
    }

    #[test]
    fn legacy_template_matches_topic_layout() {
        assert_eq!(LEGACY_MIRRORS[0].topic("3"), legacy_status_topic("3"));
        assert_eq!(LEGACY_MIRRORS[0].topic("3"), "presence/3/status.legacy");
    }

    #[test]
    fn legacy_payload_is_bare_token() {
        assert_eq!((LEGACY_MIRRORS[0].payload)(&event(true)), b"present");
        assert_eq!((LEGACY_MIRRORS[0].payload)(&event(false)), b"absent");
    }

    #[test]
    fn publish_queues_primary_and_mirror() {
        let (t, _driver) = transport(2);
        let publisher = EventPublisher::new(t.clone(), LEGACY_MIRRORS);

        publisher.publish(&event(true)).unwrap();

        // Both slots used: the next primary is rejected.
        assert!(matches!(
            t.publish("presence/3/status", "x", QoS::AtLeastOnce, false),
            Err(TransportError::Backpressure { .. })
        ));
    }

    #[test]
    fn mirror_failure_does_not_fail_primary() {
        // Room for the primary only.
        let (t, _driver) = transport(1);
        let publisher = EventPublisher::new(t, LEGACY_MIRRORS);
        assert!(publisher.publish(&event(false)).is_ok());
    }

    #[test]
    fn primary_failure_skips_mirrors() {
        let (t, _driver) = transport(1);
        t.publish("presence/other/status", "x", QoS::AtLeastOnce, false).unwrap();
        let publisher = EventPublisher::new(t, LEGACY_MIRRORS);

        let err = publisher.publish(&event(true)).unwrap_err();
        assert!(matches!(err, PublishError::Transport(TransportError::Backpressure { capacity: 1 })));
    }

    #[test]
    fn no_mirrors_publishes_primary_only() {
        let (t, _driver) = transport(1);
        let publisher = EventPublisher::new(t, &[]);
        publisher.publish(&event(true)).unwrap();
    }
}
