//! The transport: a cheap, cloneable [`Transport`] handle for publishing and
//! subscribing, and a [`TransportDriver`] that owns the broker session.
//!
//! The handle never touches the network. `publish` validates the payload
//! and pushes onto a bounded queue; the driver drains that queue only while
//! connected, so a long outage fills the queue and callers see
//! [`TransportError::Backpressure`] instead of silent loss.
//!
//! The driver runs the [`ConnectionMachine`]: one MQTT session per
//! connection, exponential backoff between failed connects and between
//! sessions that drop before they are stable, a keepalive ping
//! on [`PING_TOPIC`], and a forced reconnect when the link goes quiet for
//! longer than the liveness timeout. Subscriptions live in a registry on the
//! handle side and are re-sent after every connect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::connection::{ConnectionMachine, ConnectionState, Liveness};
use crate::error::TransportError;
use crate::event::now_epoch_ms;
use crate::outbound::{InFlight, Outbound, Written};
use crate::payload::validate_payload;
use crate::topic::{is_valid_publish_topic, topic_matches, PING_TOPIC};

/// Callback for inbound messages: `(topic, payload)`.
///
/// Handlers run on the driver task. Anything slow belongs in a spawned task.
pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared state between handle and driver
// ---------------------------------------------------------------------------

struct Subscription {
    pattern: String,
    qos: QoS,
    handler: Handler,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    publish_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of the transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub published: u64,
    pub received: u64,
    pub dropped: u64,
    pub publish_errors: u64,
    pub reconnects: u64,
}

struct Shared {
    subscriptions: RwLock<Vec<Subscription>>,
    counters: Counters,
    queue_capacity: usize,
    max_payload_bytes: usize,
}

impl Shared {
    /// Invoke every handler whose pattern matches `topic`. Returns how many ran.
    fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers: Vec<Handler> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in &handlers {
            handler(topic, payload);
        }
        handlers.len()
    }

    fn patterns(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| (s.pattern.clone(), s.qos))
            .collect()
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

enum Command {
    Subscribe { pattern: String, qos: QoS },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Publishing and subscribing front-end. Clone freely.
#[derive(Clone)]
pub struct Transport {
    outbound: mpsc::Sender<Outbound>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
    shared: Arc<Shared>,
}

impl Transport {
    /// Build a handle and the driver that serves it. Nothing connects until
    /// [`TransportDriver::run`] is awaited.
    pub fn new(mut config: TransportConfig) -> (Self, TransportDriver) {
        if config.client_id.trim().is_empty() {
            config.client_id = format!("presence-{}", now_epoch_ms());
        }
        let capacity = config.queue_capacity.max(1);

        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            subscriptions: RwLock::new(Vec::new()),
            counters: Counters::default(),
            queue_capacity: capacity,
            max_payload_bytes: config.max_payload_bytes,
        });

        let machine = ConnectionMachine::new(
            config.backoff(),
            config.max_reconnect_attempts,
            config.stable_session(),
        );
        let in_flight = InFlight::new(config.publish_timeout());

        let handle = Self {
            outbound: outbound_tx,
            commands: commands_tx,
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
            shared: Arc::clone(&shared),
        };

        let driver = TransportDriver {
            config,
            machine,
            outbound_rx,
            commands_rx,
            state_tx,
            shutdown_rx,
            shared,
            retry: VecDeque::new(),
            in_flight,
        };

        (handle, driver)
    }

    /// Queue a message for delivery. Returns as soon as the message is in
    /// the outbound queue; never waits on the network.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::ShutDown);
        }
        if !is_valid_publish_topic(topic) {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }

        let payload = payload.into();
        validate_payload(&payload, self.shared.max_payload_bytes)?;

        let msg = Outbound::new(topic.to_string(), payload, qos, retain);
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure {
                capacity: self.shared.queue_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => match *self.state.borrow() {
                ConnectionState::GiveUp { attempts } => TransportError::GaveUp { attempts },
                _ => TransportError::ShutDown,
            },
        })
    }

    /// Register `handler` for every inbound message matching `pattern`.
    /// The subscription is (re)asserted on every connect.
    pub fn subscribe<F>(&self, pattern: &str, qos: QoS, handler: F) -> Result<(), TransportError>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        if pattern.trim().is_empty() {
            return Err(TransportError::InvalidTopic(pattern.to_string()));
        }

        self.shared
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                pattern: pattern.to_string(),
                qos,
                handler: Arc::new(handler),
            });

        // The driver may be gone already; the registry entry is what counts.
        let _ = self.commands.send(Command::Subscribe {
            pattern: pattern.to_string(),
            qos,
        });
        debug!(pattern, "subscription registered");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        TransportStats {
            published: c.published.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting publishes and ask the driver to flush and exit.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Outcome of a clean driver exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Messages confirmed during the shutdown grace period.
    pub flushed: usize,
    /// Messages discarded because the grace period ran out or the link was down.
    pub dropped: usize,
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

enum Served {
    Lost,
    Shutdown(ShutdownReport),
}

pub struct TransportDriver {
    config: TransportConfig,
    machine: ConnectionMachine,
    outbound_rx: mpsc::Receiver<Outbound>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    retry: VecDeque<Outbound>,
    in_flight: InFlight,
}

impl TransportDriver {
    /// Run until shutdown (`Ok`) or until the reconnect budget is spent
    /// (`Err(GaveUp)`).
    pub async fn run(mut self) -> Result<ShutdownReport, TransportError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "transport starting"
        );
        let mut ever_connected = false;

        loop {
            if self.shutdown_requested() {
                return Ok(self.discard_all("shutdown while disconnected"));
            }

            match self.machine.state() {
                ConnectionState::Disconnected => {
                    self.machine.begin_connect(Instant::now())?;
                    self.publish_state();
                }
                ConnectionState::Backoff { attempt, .. } => {
                    let wait = self.machine.retry_in(Instant::now());
                    debug!(attempt, wait_ms = wait.as_millis() as u64, "transport backing off");
                    tokio::select! {
                        _ = time::sleep(wait) => {}
                        _ = self.shutdown_rx.changed() => continue,
                    }
                    self.machine.begin_connect(Instant::now())?;
                    self.publish_state();
                }
                ConnectionState::Connecting => {
                    let attempt = tokio::select! {
                        r = connect_once(&self.config) => r,
                        _ = self.shutdown_rx.changed() => continue,
                    };
                    match attempt {
                        Ok(session) => {
                            self.machine.connected(Instant::now());
                            self.publish_state();
                            if ever_connected {
                                Shared::bump(&self.shared.counters.reconnects, 1);
                            }
                            ever_connected = true;
                            info!(host = %self.config.host, port = self.config.port, "transport connected");

                            match self.serve(session).await {
                                Served::Lost => {
                                    let st = self.machine.lost(Instant::now());
                                    self.requeue_in_flight();
                                    self.publish_state();
                                    match st {
                                        ConnectionState::Backoff { attempt, .. } => {
                                            warn!(attempt, "session dropped before it was stable; backing off");
                                        }
                                        ConnectionState::GiveUp { attempts } => {
                                            error!(attempts, "session keeps dropping, giving up");
                                        }
                                        _ => {}
                                    }
                                }
                                Served::Shutdown(report) => {
                                    self.publish_state();
                                    return Ok(report);
                                }
                            }
                        }
                        Err(e) => {
                            let st = self.machine.connect_failed(Instant::now());
                            self.publish_state();
                            match st {
                                ConnectionState::Backoff { attempt, .. } => {
                                    warn!(attempt, error = %e, "transport connect failed");
                                }
                                ConnectionState::GiveUp { attempts } => {
                                    error!(attempts, error = %e, "transport connect failed, giving up");
                                }
                                _ => {}
                            }
                        }
                    }
                }
                ConnectionState::Connected => {
                    // serve() always leaves Connected before returning.
                    self.machine.closed();
                }
                ConnectionState::GiveUp { attempts } => {
                    self.outbound_rx.close();
                    let report = self.discard_all("reconnect budget exhausted");
                    error!(attempts, dropped = report.dropped, "transport gave up; client must be rebuilt");
                    return Err(TransportError::GaveUp { attempts });
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.machine.state());
    }

    /// Serve an established session until it is lost or shutdown is asked for.
    async fn serve(&mut self, mut session: Session) -> Served {
        // Subscribe requests queued before this connect are covered by the
        // full resubscribe below.
        while self.commands_rx.try_recv().is_ok() {}
        for (pattern, qos) in self.shared.patterns() {
            if let Err(e) = session.client.try_subscribe(pattern.clone(), qos) {
                warn!(%pattern, error = %e, "resubscribe failed");
                return Served::Lost;
            }
            debug!(%pattern, "subscribed");
        }

        let now = Instant::now();
        let mut liveness = Liveness::new(now, self.config.liveness_timeout());
        let mut keepalive = time::interval_at(now + self.config.keepalive(), self.config.keepalive());
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sweep_every = (self.config.publish_timeout() / 4).max(Duration::from_millis(10));
        let mut sweep = time::interval_at(now + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Set when the session's request channel is full; cleared by any
        // session progress.
        let mut session_full = false;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    return Served::Shutdown(self.flush_and_close(session).await);
                }
                polled = session.eventloop.poll() => {
                    session_full = false;
                    match polled {
                        Ok(event) => {
                            if matches!(event, Event::Incoming(_)) {
                                liveness.touch(Instant::now());
                            }
                            self.on_event(event);
                        }
                        Err(e) => {
                            warn!(error = %e, "transport connection lost");
                            return Served::Lost;
                        }
                    }
                }
                Some(msg) = next_outbound(&mut self.retry, &mut self.outbound_rx), if !session_full => {
                    session_full = !self.hand_off(&session.client, msg);
                }
                Some(cmd) = self.commands_rx.recv() => {
                    let Command::Subscribe { pattern, qos } = cmd;
                    if let Err(e) = session.client.try_subscribe(pattern.clone(), qos) {
                        warn!(%pattern, error = %e, "subscribe failed; will retry on reconnect");
                    }
                }
                _ = keepalive.tick() => {
                    let now = Instant::now();
                    if liveness.is_stale(now) {
                        warn!(
                            silent_ms = liveness.silent_for(now).as_millis() as u64,
                            "no traffic within liveness timeout; reconnecting"
                        );
                        return Served::Lost;
                    }
                    self.retry.push_back(Outbound::ping(PING_TOPIC));
                }
                _ = sweep.tick() => {
                    if self.in_flight.has_expired(Instant::now()) {
                        warn!(in_flight = self.in_flight.len(), "publish attempt timed out; reconnecting");
                        return Served::Lost;
                    }
                }
            }
        }
    }

    /// Hand one message to the session. Returns false if the session's
    /// request channel is full (the message goes back to the front of the
    /// retry buffer, no attempt is charged).
    fn hand_off(&mut self, client: &AsyncClient, msg: Outbound) -> bool {
        match client.try_publish(msg.topic.clone(), msg.qos, msg.retain, msg.payload.clone()) {
            Ok(()) => {
                self.in_flight.handed_off(msg, Instant::now());
                true
            }
            Err(_) => {
                self.retry.push_front(msg);
                false
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(p)) => {
                Shared::bump(&self.shared.counters.received, 1);
                let handled = self.shared.dispatch(&p.topic, &p.payload);
                if handled == 0 {
                    debug!(topic = %p.topic, "no handler for inbound message");
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if let Some(msg) = self.in_flight.on_acked(ack.pkid) {
                    self.delivered(&msg);
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                if let Some(msg) = self.in_flight.on_acked(comp.pkid) {
                    self.delivered(&msg);
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if let Written::Delivered(msg) = self.in_flight.on_written(pkid) {
                    self.delivered(&msg);
                }
            }
            _ => {}
        }
    }

    fn delivered(&self, msg: &Outbound) {
        if !msg.internal {
            Shared::bump(&self.shared.counters.published, 1);
            debug!(topic = %msg.topic, attempts = msg.attempts + 1, "published");
        }
    }

    /// Charge one failed attempt; drop the message if its budget is spent.
    fn charge_attempt(&self, msg: Outbound) -> Option<Outbound> {
        let topic = msg.topic.clone();
        let internal = msg.internal;
        let retained = msg.failed_attempt(self.config.max_publish_attempts);
        if retained.is_none() && !internal {
            Shared::bump(&self.shared.counters.dropped, 1);
            warn!(
                %topic,
                attempts = self.config.max_publish_attempts,
                "message dropped after exhausting publish attempts"
            );
        }
        retained
    }

    /// Session died with messages in flight: each counts one failed attempt.
    /// Survivors go ahead of anything already waiting, oldest first.
    fn requeue_in_flight(&mut self) {
        let pending = self.in_flight.drain();
        if pending.is_empty() {
            return;
        }
        Shared::bump(&self.shared.counters.publish_errors, pending.len() as u64);
        debug!(count = pending.len(), "requeueing in-flight messages");

        let survivors: Vec<Outbound> = pending.into_iter().filter_map(|m| self.charge_attempt(m)).collect();
        for msg in survivors.into_iter().rev() {
            self.retry.push_front(msg);
        }
    }

    /// Deliver whatever is queued within the grace period, then disconnect.
    async fn flush_and_close(&mut self, mut session: Session) -> ShutdownReport {
        self.outbound_rx.close();
        let published_before = self.shared.counters.published.load(Ordering::Relaxed);
        let deadline = Instant::now() + self.config.shutdown_grace();
        let mut session_full = false;

        let flush = async {
            loop {
                if !session_full {
                    if let Some(msg) = self.retry.pop_front().or_else(|| self.outbound_rx.try_recv().ok()) {
                        if msg.internal {
                            continue;
                        }
                        session_full = !self.hand_off(&session.client, msg);
                        continue;
                    }
                }
                if self.in_flight.is_empty() && !session_full {
                    return true;
                }
                match session.eventloop.poll().await {
                    Ok(event) => {
                        session_full = false;
                        self.on_event(event);
                    }
                    Err(e) => {
                        warn!(error = %e, "connection lost during shutdown flush");
                        return false;
                    }
                }
            }
        };
        let completed = matches!(time::timeout_at(deadline, flush).await, Ok(true));

        if completed {
            let _ = session.client.try_disconnect();
            let _ = time::timeout_at(deadline.max(Instant::now() + Duration::from_millis(100)), async {
                while let Ok(event) = session.eventloop.poll().await {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
            })
            .await;
        }

        let flushed = self.shared.counters.published.load(Ordering::Relaxed) - published_before;
        let unconfirmed = self.in_flight.drain().into_iter().filter(|m| !m.internal).count();
        if unconfirmed > 0 {
            Shared::bump(&self.shared.counters.dropped, unconfirmed as u64);
            warn!(unconfirmed, "messages unconfirmed when shutdown grace period ended");
        }
        let mut report = self.discard_all("shutdown grace period elapsed");
        report.dropped += unconfirmed;
        report.flushed = flushed as usize;

        self.machine.closed();
        info!(flushed = report.flushed, dropped = report.dropped, "transport shut down");
        report
    }

    /// Drop everything still queued and log how much was lost.
    fn discard_all(&mut self, reason: &str) -> ShutdownReport {
        self.outbound_rx.close();
        let mut dropped = self.retry.drain(..).filter(|m| !m.internal).count();
        while let Ok(msg) = self.outbound_rx.try_recv() {
            if !msg.internal {
                dropped += 1;
            }
        }

        if dropped > 0 {
            Shared::bump(&self.shared.counters.dropped, dropped as u64);
            warn!(dropped, reason, "discarded queued messages");
        }
        ShutdownReport { flushed: 0, dropped }
    }
}

fn open_session(cfg: &TransportConfig) -> Session {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    // rumqttc only accepts whole seconds here.
    let keepalive_secs = cfg.keepalive_ms.div_ceil(1000).max(1);
    opts.set_keep_alive(Duration::from_secs(keepalive_secs));
    opts.set_clean_session(true);
    let max_packet = cfg.max_packet_bytes();
    opts.set_max_packet_size(max_packet, max_packet);
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }

    let (client, eventloop) = AsyncClient::new(opts, cfg.queue_capacity.max(1));
    Session { client, eventloop }
}

/// One connect attempt: a fresh session polled until the broker's ConnAck.
async fn connect_once(cfg: &TransportConfig) -> Result<Session, TransportError> {
    let mut session = open_session(cfg);
    let handshake = async {
        loop {
            match session.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(TransportError::from(e)),
            }
        }
    };

    let outcome = time::timeout(cfg.connect_timeout(), handshake).await;
    match outcome {
        Ok(Ok(())) => Ok(session),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::ConnectTimeout),
    }
}

async fn next_outbound(
    retry: &mut VecDeque<Outbound>,
    rx: &mut mpsc::Receiver<Outbound>,
) -> Option<Outbound> {
    if let Some(msg) = retry.pop_front() {
        return Some(msg);
    }
    rx.recv().await
}

// ===========================================================================
// Tests
// ===========================================================================
