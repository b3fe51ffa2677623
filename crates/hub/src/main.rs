mod config;
mod notify;
mod state;
mod store;
mod sync;
mod web;

use anyhow::Result;
use presence_link::topic::{parse_status_topic, STATUS_PATTERN};
use presence_link::{ConnectionState, QoS, ShutdownReport, Transport, TransportError};
use std::{env, sync::Arc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use notify::CurrentLink;
use state::{HubState, SharedState};
use store::{SqliteStore, StatusStore};
use sync::StatusSynchronizer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hub.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = SqliteStore::connect(&cfg.db.url).await?;
    db.migrate().await?;
    let store: Arc<dyn StatusStore> = Arc::new(db);
    info!(subjects = store.list_status().await?.len(), "db ready");

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared: SharedState = Arc::new(RwLock::new(HubState::new()));
    shared.write().await.record_system("hub started".to_string());

    let link = Arc::new(CurrentLink::default());
    let synchronizer = Arc::new(StatusSynchronizer::new(
        Arc::clone(&store),
        link.clone(),
        cfg.sync.max_attempts,
        cfg.retry_delay(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        state: Arc::clone(&shared),
        store: Arc::clone(&store),
        link: Arc::clone(&link),
    };
    let addr = cfg.web_addr()?;
    tokio::spawn(async move {
        if let Err(e) = web::serve(addr, app).await {
            error!(error = %format!("{e:#}"), "status api stopped");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (transport, driver) = Transport::new(cfg.transport.clone());
        subscribe_status(&transport, &synchronizer, &shared)?;
        link.replace(Some(transport.clone()));

        let watcher = tokio::spawn(watch_connection(transport.state_watch(), Arc::clone(&shared)));
        let mut driver = tokio::spawn(driver.run());
        info!(
            broker = %format!("{}:{}", cfg.transport.host, cfg.transport.port),
            pattern = STATUS_PATTERN,
            "transport started"
        );

        tokio::select! {
            joined = &mut driver => {
                link.replace(None);
                watcher.abort();
                report_driver_exit(joined);
                shared
                    .write()
                    .await
                    .record_system(format!("transport down; rebuilding in {} ms", cfg.hub.reinit_delay_ms));
                warn!(delay_ms = cfg.hub.reinit_delay_ms, "transport down; rebuilding after delay");

                tokio::select! {
                    _ = sleep(cfg.reinit_delay()) => {}
                    res = &mut shutdown => {
                        log_signal(res);
                        break;
                    }
                }
            }
            res = &mut shutdown => {
                log_signal(res);
                info!("shutting down");
                transport.shutdown();
                link.replace(None);
                report_driver_exit(driver.await);
                watcher.abort();
                break;
            }
        }
    }

    Ok(())
}

/// Route every structured status message to the synchronizer, one task per
/// message.
fn subscribe_status(
    transport: &Transport,
    synchronizer: &Arc<StatusSynchronizer>,
    shared: &SharedState,
) -> Result<(), TransportError> {
    let synchronizer = Arc::clone(synchronizer);
    let shared = Arc::clone(shared);

    transport.subscribe(STATUS_PATTERN, QoS::AtLeastOnce, move |topic, payload| {
        let Some(subject_id) = parse_status_topic(topic) else {
            debug!(topic, "ignoring non-status topic");
            return;
        };
        let subject_id = subject_id.to_string();
        let payload = payload.to_vec();
        let synchronizer = Arc::clone(&synchronizer);
        let shared = Arc::clone(&shared);

        tokio::spawn(async move {
            let result = synchronizer.on_presence_message(&subject_id, &payload).await;
            shared.write().await.record_outcome(&subject_id, &result);
        });
    })
}

async fn watch_connection(mut rx: watch::Receiver<ConnectionState>, shared: SharedState) {
    loop {
        let current = *rx.borrow_and_update();
        shared.write().await.record_connection(current);
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn log_signal(res: std::io::Result<()>) {
    if let Err(e) = res {
        error!(error = %e, "failed to listen for ctrl-c; shutting down");
    }
}

fn report_driver_exit(joined: Result<Result<ShutdownReport, TransportError>, JoinError>) {
    match joined {
        Ok(Ok(report)) => info!(flushed = report.flushed, dropped = report.dropped, "transport stopped"),
        Ok(Err(e)) => error!(error = %e, "transport failed"),
        Err(e) => error!(error = %e, "transport task panicked"),
    }
}
