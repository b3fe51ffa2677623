//! Where observations come from.
//!
//! The detector polls a [`SignalSource`] once per scan cycle. Radio stacks
//! that deliver sightings through callbacks push into a [`QueueSink`]
//! instead; the paired [`QueueSource`] drains whatever accumulated since the
//! last cycle, so there is still exactly one decision per cycle.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::detector::Observation;

pub trait SignalSource: Send {
    /// Everything observed since the previous call. May be empty.
    fn poll_observations(&mut self) -> Vec<Observation>;
}

// ---------------------------------------------------------------------------
// Push-style adapter
// ---------------------------------------------------------------------------

/// Producer half of a bounded observation queue. Clone for each callback.
#[derive(Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<Observation>,
}

impl QueueSink {
    /// Offer one observation. Returns false if the queue is full or the
    /// source is gone; the sighting is dropped in that case.
    pub fn push(&self, observation: Observation) -> bool {
        self.tx.try_send(observation).is_ok()
    }
}

pub struct QueueSource {
    rx: mpsc::Receiver<Observation>,
}

impl QueueSource {
    /// A queue holding at most `capacity` sightings between cycles.
    pub fn channel(capacity: usize) -> (QueueSink, QueueSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (QueueSink { tx }, QueueSource { rx })
    }
}

impl SignalSource for QueueSource {
    fn poll_observations(&mut self) -> Vec<Observation> {
        let mut out = Vec::new();
        while let Ok(obs) = self.rx.try_recv() {
            out.push(obs);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Line feed (external scanner piped to stdin)
// ---------------------------------------------------------------------------

/// Parse a scanner line of the form `<address> <rssi>`, e.g.
/// `AA:BB:CC:DD:EE:FF -67`. Extra trailing fields are ignored.
pub fn parse_observation_line(line: &str) -> Option<Observation> {
    let mut fields = line.split_whitespace();
    let identity = fields.next()?;
    let rssi: i32 = fields.next()?.parse().ok()?;
    Some(Observation::new(identity, rssi))
}

/// Feed every parseable line of `reader` into `sink` until EOF.
pub async fn feed_lines<R>(reader: R, sink: QueueSink) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut dropped = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_observation_line(&line) {
            Some(obs) => {
                if !sink.push(obs) {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        warn!(dropped, "observation queue full; dropping sightings");
                    }
                }
            }
            None => debug!(%line, "unparseable scanner line"),
        }
    }
    info!("scanner feed closed");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
