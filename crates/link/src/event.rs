//! The presence event exchanged between node and hub.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One confirmed presence transition (or a periodic restatement of the
/// current status). Immutable once built.
///
/// Wire form: `{"subjectId":"3","present":true,"identity":"AA:BB:..","emittedAt":1700000000000}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub subject_id: String,
    pub present: bool,
    pub identity: String,
    /// Wall-clock emission time, milliseconds since the Unix epoch.
    pub emitted_at: i64,
}

impl PresenceEvent {
    pub fn new(subject_id: impl Into<String>, present: bool, identity: impl Into<String>, emitted_at: i64) -> Self {
        Self {
            subject_id: subject_id.into(),
            present,
            identity: identity.into(),
            emitted_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Bare status token used by legacy consumers.
    pub fn status_token(&self) -> &'static str {
        status_token(self.present)
    }
}

pub fn status_token(present: bool) -> &'static str {
    if present {
        "present"
    } else {
        "absent"
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
