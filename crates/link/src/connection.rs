//! Connection state machine and liveness tracking.
//!
//! ```text
//! Disconnected ──▶ Connecting ──[ConnAck]──▶ Connected
//!      ▲               │                        │
//!      │          [failure]                [I/O error, close,
//!      │               │                    liveness timeout]
//!      │               ▼                        │
//!      │      Backoff(k, next_retry_at) ◀──[up < stable_after]
//!      │               │                        │
//!      │       [deadline reached]       [up >= stable_after]
//!      │               ▼                        │
//!      │          Connecting ...                │
//!      └────────────────────────────────────────┘
//!
//!  k == max_attempts ──▶ GiveUp   (terminal; rebuild the client)
//! ```
//!
//! A session that drops before `stable_after` counts as a failed attempt,
//! so a broker that accepts and then immediately closes is backed off like
//! one that refuses. Only a session that outlives the window resets the
//! failure counter.
//!
//! All transitions go through [`ConnectionMachine`]; the failure counter
//! has no other writer.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff { attempt: u32, next_retry_at: Instant },
    GiveUp { attempts: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GiveUp { .. })
    }

    /// Short label for logs and the status API.
    pub fn label(&self) -> ConnectionLabel {
        match self {
            Self::Disconnected => ConnectionLabel::Disconnected,
            Self::Connecting => ConnectionLabel::Connecting,
            Self::Connected => ConnectionLabel::Connected,
            Self::Backoff { .. } => ConnectionLabel::Backoff,
            Self::GiveUp { .. } => ConnectionLabel::GiveUp,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff { attempt, .. } => write!(f, "backoff (attempt {attempt})"),
            Self::GiveUp { attempts } => write!(f, "gave up after {attempts} attempts"),
            other => write!(f, "{:?}", other.label()),
        }
    }
}

/// Serialisable projection of [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionLabel {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    GiveUp,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct ConnectionMachine {
    state: ConnectionState,
    failures: u32,
    backoff: Backoff,
    max_attempts: u32,
    stable_after: Duration,
    connected_at: Option<Instant>,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff, max_attempts: u32, stable_after: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failures: 0,
            backoff,
            max_attempts: max_attempts.max(1),
            stable_after,
            connected_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts (refused connects and quick drops) since
    /// the last stable session.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Enter `Connecting`. Allowed from `Disconnected`, or from `Backoff`
    /// once its deadline has passed.
    pub fn begin_connect(&mut self, now: Instant) -> Result<(), TransportError> {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Backoff { next_retry_at, .. } if now >= next_retry_at => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Backoff { .. } | ConnectionState::Connecting | ConnectionState::Connected => {
                Ok(())
            }
            ConnectionState::GiveUp { attempts } => Err(TransportError::GaveUp { attempts }),
        }
    }

    /// The broker acknowledged the connection. The failure counter is kept
    /// until the session proves stable.
    pub fn connected(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.connected_at = Some(now);
        }
    }

    /// A connect attempt failed. Returns the new state: `Backoff` with the
    /// next retry deadline, or `GiveUp` once the budget is spent.
    pub fn connect_failed(&mut self, now: Instant) -> ConnectionState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.charge_failure(now)
    }

    /// An established connection dropped. A session shorter than
    /// `stable_after` is charged as a failed attempt and returns `Backoff`
    /// or `GiveUp`; a longer one resets the counter and returns
    /// `Disconnected` for an immediate reconnect.
    pub fn lost(&mut self, now: Instant) -> ConnectionState {
        if self.state != ConnectionState::Connected {
            return self.state;
        }

        let lasted = self
            .connected_at
            .take()
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
        if lasted >= self.stable_after {
            self.failures = 0;
            self.state = ConnectionState::Disconnected;
            self.state
        } else {
            self.charge_failure(now)
        }
    }

    /// The connection was closed on purpose. Nothing is charged.
    pub fn closed(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            self.connected_at = None;
        }
    }

    fn charge_failure(&mut self, now: Instant) -> ConnectionState {
        self.failures = self.failures.saturating_add(1);
        self.state = if self.failures >= self.max_attempts {
            ConnectionState::GiveUp {
                attempts: self.failures,
            }
        } else {
            ConnectionState::Backoff {
                attempt: self.failures,
                next_retry_at: now + self.backoff.delay(self.failures),
            }
        };
        self.state
    }

    /// Time left until the backoff deadline, zero when a retry is due.
    pub fn retry_in(&self, now: Instant) -> Duration {
        match self.state {
            ConnectionState::Backoff { next_retry_at, .. } => next_retry_at.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Tracks the last time any traffic was seen on the connection.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    last_traffic: Instant,
    timeout: Duration,
}

impl Liveness {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            last_traffic: now,
            timeout,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_traffic = now;
    }

    /// True once no traffic has been observed for longer than the timeout.
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_traffic) > self.timeout
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_traffic)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
