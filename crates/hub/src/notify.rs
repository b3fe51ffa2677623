//! Derived `status_changed` notifications over whichever transport is live.

use std::sync::{PoisonError, RwLock};

use presence_link::topic::NOTIFICATIONS_TOPIC;
use presence_link::{QoS, Transport, TransportError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::StatusRecord;
use crate::sync::Notifier;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusChanged<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    subject_id: &'a str,
    present: bool,
    updated_at: i64,
    source_identity: &'a str,
}

pub fn status_changed_payload(record: &StatusRecord) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&StatusChanged {
        kind: "status_changed",
        subject_id: &record.subject_id,
        present: record.present,
        updated_at: record.updated_at,
        source_identity: &record.source_identity,
    })
}

/// The transport currently serving the hub, swapped out when the client is
/// rebuilt. Empty between a give-up and the rebuild.
#[derive(Default)]
pub struct CurrentLink {
    transport: RwLock<Option<Transport>>,
}

impl CurrentLink {
    pub fn replace(&self, transport: Option<Transport>) {
        *self.transport.write().unwrap_or_else(PoisonError::into_inner) = transport;
    }

    pub fn get(&self) -> Option<Transport> {
        self.transport.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Notifier for CurrentLink {
    fn status_changed(&self, record: &StatusRecord) {
        let Some(transport) = self.get() else {
            debug!(subject = %record.subject_id, "no transport; notification skipped");
            return;
        };

        let payload = match status_changed_payload(record) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode notification");
                return;
            }
        };

        match transport.publish(NOTIFICATIONS_TOPIC, payload, QoS::AtLeastOnce, false) {
            Ok(()) => {}
            Err(TransportError::Backpressure { capacity }) => {
                warn!(subject = %record.subject_id, capacity, "outbound queue full; notification dropped")
            }
            Err(e) => warn!(subject = %record.subject_id, error = %e, "notification publish failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_link::TransportConfig;

    fn record() -> StatusRecord {
        StatusRecord {
            subject_id: "3".into(),
            present: true,
            updated_at: 1_700_000_000_000,
            source_identity: "AA:BB:CC:DD:EE:FF".into(),
        }
    }

    #[test]
    fn payload_shape() {
        let json: serde_json::Value = serde_json::from_slice(&status_changed_payload(&record()).unwrap()).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["subjectId"], "3");
        assert_eq!(json["present"], true);
        assert_eq!(json["updatedAt"], 1_700_000_000_000_i64);
        assert_eq!(json["sourceIdentity"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json.as_object().unwrap().len(), 5);
    }

    #[test]
    fn empty_link_is_a_no_op() {
        let link = CurrentLink::default();
        assert!(link.get().is_none());
        link.status_changed(&record());
    }

    #[test]
    fn notification_is_queued_on_live_transport() {
        let (transport, _driver) = Transport::new(TransportConfig {
            client_id: "notify-test".into(),
            queue_capacity: 1,
            ..TransportConfig::default()
        });
        let link = CurrentLink::default();
        link.replace(Some(transport.clone()));

        link.status_changed(&record());

        // The single slot is taken by the notification.
        assert!(matches!(
            transport.publish("presence/system/x", "y", QoS::AtMostOnce, false),
            Err(TransportError::Backpressure { capacity: 1 })
        ));
    }

    #[test]
    fn replace_with_none_clears() {
        let (transport, _driver) = Transport::new(TransportConfig::default());
        let link = CurrentLink::default();
        link.replace(Some(transport));
        assert!(link.get().is_some());
        link.replace(None);
        assert!(link.get().is_none());
    }
}
