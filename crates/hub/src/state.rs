use presence_link::{ConnectionLabel, ConnectionState, TransportStats};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::store::StatusRecord;
use crate::sync::{Outcome, SyncError};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct HubState {
    pub started_at: Instant,
    pub connection: ConnectionLabel,
    pub counters: SyncCounters,
    pub events: VecDeque<HubEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
    pub persistence_failed: u64,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Applied,
    Stale,
    Malformed,
    PersistenceFailed,
    Connection,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub connection: ConnectionLabel,
    pub transport: Option<TransportStats>,
    pub counters: SyncCounters,
    pub subjects: Vec<StatusRecord>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connection: ConnectionLabel::Disconnected,
            counters: SyncCounters::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record what the synchronizer did with one message.
    pub fn record_outcome(&mut self, subject_id: &str, result: &Result<Outcome, SyncError>) {
        match result {
            Ok(Outcome::Applied { record, changed }) => {
                self.counters.applied += 1;
                // Periodic refreshes only bump the counter.
                if *changed {
                    let token = presence_link::status_token(record.present);
                    self.push_event(EventKind::Applied, format!("{subject_id} is {token}"));
                }
            }
            Ok(Outcome::Stale {
                current_updated_at,
                emitted_at,
            }) => {
                self.counters.stale += 1;
                self.push_event(
                    EventKind::Stale,
                    format!("{subject_id}: event at {emitted_at} older than record at {current_updated_at}"),
                );
            }
            Err(e) if e.is_malformed() => {
                self.counters.malformed += 1;
                self.push_event(EventKind::Malformed, format!("{subject_id}: {e}"));
            }
            Err(e) => {
                self.counters.persistence_failed += 1;
                self.push_event(EventKind::PersistenceFailed, e.to_string());
            }
        }
    }

    /// Record a transport connection state change. Repeats are ignored.
    pub fn record_connection(&mut self, state: ConnectionState) {
        let label = state.label();
        if label == self.connection {
            return;
        }
        self.connection = label;
        self.push_event(EventKind::Connection, format!("mqtt {state}"));
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, subjects: Vec<StatusRecord>, transport: Option<TransportStats>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connection: self.connection,
            transport,
            counters: self.counters,
            subjects,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
