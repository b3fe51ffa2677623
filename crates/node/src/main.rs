mod config;
mod detector;
mod legacy;
#[cfg(feature = "sim")]
mod sim;
mod source;

use std::env;
use std::future::pending;

use anyhow::{Context, Result};
use presence_link::{PresenceEvent, ShutdownReport, Transport, TransportConfig, TransportError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, SourceKind};
use detector::{CycleTime, Detector};
use legacy::{EventPublisher, PublishError, LEGACY_MIRRORS};
use source::{QueueSource, SignalSource};

/// A running transport: handle, publisher, and the driver task serving them.
struct Link {
    transport: Transport,
    publisher: EventPublisher,
    driver: JoinHandle<Result<ShutdownReport, TransportError>>,
}

impl Link {
    fn start(cfg: &TransportConfig) -> Self {
        let (transport, driver) = Transport::new(cfg.clone());
        let driver = tokio::spawn(driver.run());
        let publisher = EventPublisher::new(transport.clone(), LEGACY_MIRRORS);
        Self {
            transport,
            publisher,
            driver,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let cfg = config::load(&config_path)?;

    let mut detector = cfg.build_detector()?;
    let mut source = build_source(&cfg)?;
    info!(
        subject = %cfg.node.subject_id,
        target = %cfg.detector.target_identity,
        mode = ?cfg.detector.mode,
        broker = %format!("{}:{}", cfg.transport.host, cfg.transport.port),
        "node starting"
    );

    // ── Timers ──────────────────────────────────────────────────────
    let mut scan = time::interval(cfg.scan_interval());
    scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut refresh = time::interval_at(Instant::now() + cfg.status_refresh(), cfg.status_refresh());
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // ── Main loop ───────────────────────────────────────────────────
    let mut link = Some(Link::start(&cfg.transport));
    let mut reinit_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = scan.tick() => {
                let observations = source.poll_observations();
                if let Some(event) = detector.on_scan_cycle(&observations, CycleTime::now()) {
                    publish(link.as_ref(), &event, "transition");
                }
            }
            _ = refresh.tick() => {
                match link.as_ref() {
                    Some(l) if l.transport.state().is_connected() => {
                        publish(Some(l), &detector.current_event(CycleTime::now()), "refresh");
                    }
                    _ => debug!("not connected; skipping status refresh"),
                }
            }
            joined = driver_exit(&mut link) => {
                link = None;
                report_driver_exit(joined);
                reinit_at = Some(Instant::now() + cfg.reinit_delay());
                warn!(delay_ms = cfg.node.reinit_delay_ms, "transport down; rebuilding after delay");
            }
            _ = wait_until(reinit_at) => {
                reinit_at = None;
                info!("rebuilding transport");
                let fresh = Link::start(&cfg.transport);
                publish(Some(&fresh), &detector.current_event(CycleTime::now()), "reinit");
                link = Some(fresh);
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!(error = %e, "failed to listen for ctrl-c; shutting down");
                }
                break;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    info!("shutting down");
    if let Some(l) = link {
        l.transport.shutdown();
        report_driver_exit(l.driver.await);
    }
    Ok(())
}

fn build_source(cfg: &Config) -> Result<Box<dyn SignalSource>> {
    match cfg.source.kind {
        SourceKind::Stdin => {
            let (sink, queue) = QueueSource::channel(cfg.source.queue_capacity);
            tokio::spawn(async move {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                if let Err(e) = source::feed_lines(stdin, sink).await {
                    error!(error = %e, "scanner feed failed");
                }
            });
            info!("reading sightings from stdin");
            Ok(Box::new(queue))
        }
        #[cfg(feature = "sim")]
        SourceKind::Sim => {
            let target = cfg
                .detector
                .target_identity
                .parse()
                .context("detector.target_identity")?;
            let scanner = sim::ScanSim::new(
                sim::Scenario::from_str_lossy(&cfg.source.scenario),
                target,
                cfg.source.background_devices,
                cfg.source.commute_cycles,
            );
            info!(scenario = %scanner.scenario(), "using simulated scanner");
            Ok(Box::new(scanner))
        }
        #[cfg(not(feature = "sim"))]
        SourceKind::Sim => anyhow::bail!("source.kind = \"sim\" needs the `sim` feature"),
    }
}

fn publish(link: Option<&Link>, event: &PresenceEvent, reason: &str) {
    let Some(link) = link else {
        warn!(
            subject = %event.subject_id,
            present = event.present,
            reason,
            "no transport; status not sent"
        );
        return;
    };

    match link.publisher.publish(event) {
        Ok(()) => info!(subject = %event.subject_id, present = event.present, reason, "status queued"),
        Err(PublishError::Transport(TransportError::Backpressure { capacity })) => {
            warn!(capacity, reason, "outbound queue full; status not sent")
        }
        Err(e) => error!(error = %e, reason, "status publish failed"),
    }
}

/// Resolves when the current driver task ends; never while there is none.
async fn driver_exit(link: &mut Option<Link>) -> Result<Result<ShutdownReport, TransportError>, JoinError> {
    match link {
        Some(l) => (&mut l.driver).await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => pending().await,
    }
}

fn report_driver_exit(joined: Result<Result<ShutdownReport, TransportError>, JoinError>) {
    match joined {
        Ok(Ok(report)) => info!(flushed = report.flushed, dropped = report.dropped, "transport stopped"),
        Ok(Err(e)) => error!(error = %e, "transport failed"),
        Err(e) => error!(error = %e, "transport task panicked"),
    }
}
