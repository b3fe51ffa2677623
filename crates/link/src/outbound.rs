//! Outbound message bookkeeping.
//!
//! Every message handed to the MQTT session is tracked until the broker has
//! it: QoS 0 messages once they are written to the socket, QoS 1 and 2 once
//! the broker acknowledges them. Messages still tracked when a session dies
//! (or an attempt times out) count one failed attempt and go back to the
//! retry buffer until their attempt budget is spent.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rumqttc::QoS;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QoS,
    pub(crate) retain: bool,
    /// Failed delivery attempts so far.
    pub(crate) attempts: u32,
    /// Transport-generated traffic (pings); not counted in stats.
    pub(crate) internal: bool,
}

impl Outbound {
    pub(crate) fn new(topic: String, payload: Vec<u8>, qos: QoS, retain: bool) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
            attempts: 0,
            internal: false,
        }
    }

    pub(crate) fn ping(topic: &str) -> Self {
        Self {
            internal: true,
            ..Self::new(topic.to_string(), Vec::new(), QoS::AtMostOnce, false)
        }
    }

    /// Record a failed attempt. Returns the message if it may be retried,
    /// `None` once `max_attempts` is reached.
    pub(crate) fn failed_attempt(mut self, max_attempts: u32) -> Option<Self> {
        self.attempts += 1;
        if self.attempts >= max_attempts {
            None
        } else {
            Some(self)
        }
    }
}

#[derive(Debug)]
struct Pending {
    msg: Outbound,
    deadline: Instant,
}

/// What a written publish means for its message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Written {
    /// QoS 0: done.
    Delivered(Outbound),
    /// QoS 1/2: now waiting for the broker's ack.
    AwaitingAck,
    /// Nothing was waiting to be written.
    Untracked,
}

/// Messages handed to the session but not yet confirmed.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// Handed off, not yet written. The session writes in hand-off order.
    unwritten: VecDeque<Pending>,
    /// Written with QoS > 0, keyed by packet id.
    unacked: HashMap<u16, Pending>,
    timeout: Duration,
}

impl InFlight {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            unwritten: VecDeque::new(),
            unacked: HashMap::new(),
            timeout,
        }
    }

    pub(crate) fn handed_off(&mut self, msg: Outbound, now: Instant) {
        self.unwritten.push_back(Pending {
            msg,
            deadline: now + self.timeout,
        });
    }

    pub(crate) fn on_written(&mut self, pkid: u16) -> Written {
        let Some(pending) = self.unwritten.pop_front() else {
            return Written::Untracked;
        };
        if pending.msg.qos == QoS::AtMostOnce {
            Written::Delivered(pending.msg)
        } else {
            self.unacked.insert(pkid, pending);
            Written::AwaitingAck
        }
    }

    pub(crate) fn on_acked(&mut self, pkid: u16) -> Option<Outbound> {
        self.unacked.remove(&pkid).map(|p| p.msg)
    }

    /// True if any tracked message has passed its attempt deadline.
    pub(crate) fn has_expired(&self, now: Instant) -> bool {
        self.unwritten
            .iter()
            .chain(self.unacked.values())
            .any(|p| now >= p.deadline)
    }

    /// Remove everything still tracked, oldest hand-off first.
    pub(crate) fn drain(&mut self) -> Vec<Outbound> {
        let mut acked: Vec<Pending> = self.unacked.drain().map(|(_, p)| p).collect();
        acked.sort_by_key(|p| p.deadline);
        acked
            .into_iter()
            .chain(self.unwritten.drain(..))
            .map(|p| p.msg)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.unwritten.len() + self.unacked.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ===========================================================================
// Tests
// ===========================================================================
