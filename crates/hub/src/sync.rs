//! Applies incoming presence events to the persisted status records.
//!
//! Ordering is by event time, not arrival time: a record is only replaced
//! by an event whose `emittedAt` is at least the record's `updatedAt`.
//! Updates for one subject are serialised through a per-subject lock;
//! different subjects never wait on each other. A subject's lock only
//! exists while some update for it is running or waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use presence_link::{Identity, PresenceEvent};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{StatusRecord, StatusStore, StorageError};

/// Told about every applied update that changed a subject's presence.
pub trait Notifier: Send + Sync {
    fn status_changed(&self, record: &StatusRecord);
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Payload is not a presence event. Never retried.
    #[error("malformed presence message: {0}")]
    Malformed(String),

    #[error("topic subject '{topic}' does not match payload subject '{payload}'")]
    SubjectMismatch { topic: String, payload: String },

    /// Every attempt hit a transient storage failure. The event is dropped;
    /// the next periodic refresh from the node repairs the record.
    #[error("gave up persisting status for '{subject_id}' after {attempts} attempts: {last}")]
    PersistenceExhausted {
        subject_id: String,
        attempts: u32,
        last: StorageError,
    },

    /// A storage failure that retrying will not fix.
    #[error(transparent)]
    Storage(StorageError),
}

impl SyncError {
    /// True for bad input, as opposed to a storage problem.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::SubjectMismatch { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record now reflects the event. `changed` is false when the
    /// presence flag was already the same.
    Applied { record: StatusRecord, changed: bool },
    /// The stored record is newer than the event; nothing was written.
    Stale { current_updated_at: i64, emitted_at: i64 },
}

pub struct StatusSynchronizer {
    store: Arc<dyn StatusStore>,
    notifier: Arc<dyn Notifier>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl StatusSynchronizer {
    pub fn new(
        store: Arc<dyn StatusStore>,
        notifier: Arc<dyn Notifier>,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            locks: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// Handle one message received on `presence/{subject_id}/status`.
    pub async fn on_presence_message(&self, subject_id: &str, payload: &[u8]) -> Result<Outcome, SyncError> {
        let record = match parse_record(subject_id, payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(subject = subject_id, error = %e, "discarding presence message");
                return Err(e);
            }
        };

        let lock = self.subject_lock(subject_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(subject_id, &record).await
        };
        self.release_subject_lock(subject_id, lock);
        result
    }

    async fn apply(&self, subject_id: &str, record: &StatusRecord) -> Result<Outcome, SyncError> {
        let outcome = self.persist(record).await.inspect_err(|e| {
            error!(subject = subject_id, error = %e, "status update abandoned");
        })?;

        match &outcome {
            Outcome::Applied { record, changed: true } => {
                info!(subject = %record.subject_id, present = record.present, updated_at = record.updated_at, "status changed");
                self.notifier.status_changed(record);
            }
            Outcome::Applied { record, changed: false } => {
                debug!(subject = %record.subject_id, updated_at = record.updated_at, "status refreshed");
            }
            Outcome::Stale {
                current_updated_at,
                emitted_at,
            } => {
                info!(
                    subject = subject_id,
                    current_updated_at, emitted_at, "discarding out-of-order event"
                );
            }
        }
        Ok(outcome)
    }

    fn subject_lock(&self, subject_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(subject_id.to_string()).or_default())
    }

    /// Drop the subject's map entry once nobody else holds or waits on it.
    /// Clones are only handed out under the map mutex, so the count
    /// cannot grow while it is checked here.
    fn release_subject_lock(&self, subject_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map's copy plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(subject_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn persist(&self, record: &StatusRecord) -> Result<Outcome, SyncError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_apply(record).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !e.is_transient() => return Err(SyncError::Storage(e)),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(SyncError::PersistenceExhausted {
                        subject_id: record.subject_id.clone(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        subject = %record.subject_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "storage unavailable; retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn try_apply(&self, record: &StatusRecord) -> Result<Outcome, StorageError> {
        let current = self.store.load_status(&record.subject_id).await?;

        if let Some(current) = &current {
            if current.updated_at > record.updated_at {
                return Ok(Outcome::Stale {
                    current_updated_at: current.updated_at,
                    emitted_at: record.updated_at,
                });
            }
        }

        self.store.save_status(record).await?;
        Ok(Outcome::Applied {
            record: record.clone(),
            changed: current.map_or(true, |c| c.present != record.present),
        })
    }
}

/// Parse and check a status payload, producing the record it would write.
fn parse_record(subject_id: &str, payload: &[u8]) -> Result<StatusRecord, SyncError> {
    let event = PresenceEvent::from_json(payload).map_err(|e| SyncError::Malformed(e.to_string()))?;

    if event.subject_id != subject_id {
        return Err(SyncError::SubjectMismatch {
            topic: subject_id.to_string(),
            payload: event.subject_id,
        });
    }

    let identity: Identity = event
        .identity
        .parse()
        .map_err(|e: presence_link::InvalidIdentity| SyncError::Malformed(e.to_string()))?;

    Ok(StatusRecord {
        subject_id: event.subject_id,
        present: event.present,
        updated_at: event.emitted_at,
        source_identity: identity.to_string(),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<StatusRecord>>,
    }

    impl RecordingNotifier {
        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl Notifier for RecordingNotifier {
        fn status_changed(&self, record: &StatusRecord) {
            self.seen.lock().unwrap().push(record.clone());
        }
    }

    /// Fails the first `failures` saves with the given error, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        transient: bool,
        saves: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                inner: MemoryStore::default(),
                failures: AtomicU32::new(failures),
                transient,
                saves: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusStore for FlakyStore {
        async fn load_status(&self, subject_id: &str) -> Result<Option<StatusRecord>, StorageError> {
            self.inner.load_status(subject_id).await
        }

        async fn save_status(&self, record: &StatusRecord) -> Result<(), StorageError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(if self.transient {
                    StorageError::Unavailable("database is locked".into())
                } else {
                    StorageError::Backend("no such table: status".into())
                });
            }
            self.inner.save_status(record).await
        }

        async fn list_status(&self) -> Result<Vec<StatusRecord>, StorageError> {
            self.inner.list_status().await
        }
    }

    fn payload(subject: &str, present: bool, emitted_at: i64) -> Vec<u8> {
        PresenceEvent::new(subject, present, MAC, emitted_at).to_json().unwrap()
    }

    fn synchronizer(store: Arc<dyn StatusStore>) -> (StatusSynchronizer, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let sync = StatusSynchronizer::new(store, notifier.clone(), 3, Duration::from_millis(200));
        (sync, notifier)
    }

    #[tokio::test]
    async fn first_event_creates_record() {
        let store = Arc::new(MemoryStore::default());
        let (sync, notifier) = synchronizer(store.clone());

        let outcome = sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap();

        let expected = StatusRecord {
            subject_id: "3".into(),
            present: true,
            updated_at: 1_000,
            source_identity: MAC.into(),
        };
        assert_eq!(
            outcome,
            Outcome::Applied {
                record: expected.clone(),
                changed: true
            }
        );
        assert_eq!(store.load_status("3").await.unwrap(), Some(expected));
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn same_event_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let (sync, notifier) = synchronizer(store.clone());
        let msg = payload("3", true, 1_000);

        sync.on_presence_message("3", &msg).await.unwrap();
        let once = store.load_status("3").await.unwrap();

        let second = sync.on_presence_message("3", &msg).await.unwrap();
        let twice = store.load_status("3").await.unwrap();

        assert_eq!(once, twice);
        assert!(matches!(second, Outcome::Applied { changed: false, .. }));
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn older_event_never_overwrites_newer() {
        let store = Arc::new(MemoryStore::default());
        let (sync, notifier) = synchronizer(store.clone());

        sync.on_presence_message("3", &payload("3", false, 2_000)).await.unwrap();
        let outcome = sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Stale {
                current_updated_at: 2_000,
                emitted_at: 1_000
            }
        );
        let record = store.load_status("3").await.unwrap().unwrap();
        assert!(!record.present);
        assert_eq!(record.updated_at, 2_000);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn equal_timestamp_is_applied() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());

        sync.on_presence_message("3", &payload("3", false, 5_000)).await.unwrap();
        let outcome = sync.on_presence_message("3", &payload("3", true, 5_000)).await.unwrap();

        assert!(matches!(outcome, Outcome::Applied { changed: true, .. }));
        assert!(store.load_status("3").await.unwrap().unwrap().present);
    }

    #[tokio::test]
    async fn newer_event_flips_presence() {
        let store = Arc::new(MemoryStore::default());
        let (sync, notifier) = synchronizer(store.clone());

        sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap();
        sync.on_presence_message("3", &payload("3", false, 2_000)).await.unwrap();

        assert!(!store.load_status("3").await.unwrap().unwrap().present);
        assert_eq!(notifier.count(), 2);
    }

    #[tokio::test]
    async fn non_json_leaves_record_untouched() {
        let store = Arc::new(MemoryStore::default());
        let (sync, notifier) = synchronizer(store.clone());
        sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap();
        let before = store.load_status("3").await.unwrap();

        let err = sync.on_presence_message("3", b"present").await.unwrap_err();

        assert!(matches!(err, SyncError::Malformed(_)));
        assert!(err.is_malformed());
        assert_eq!(store.load_status("3").await.unwrap(), before);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn bad_identity_is_malformed() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());
        let raw = br#"{"subjectId":"3","present":true,"identity":"not-a-mac","emittedAt":1}"#;

        let err = sync.on_presence_message("3", raw).await.unwrap_err();

        assert!(matches!(err, SyncError::Malformed(_)));
        assert_eq!(store.load_status("3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn identity_is_stored_normalised() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());
        let raw = br#"{"subjectId":"3","present":true,"identity":"aa-bb-cc-dd-ee-ff","emittedAt":1}"#;

        sync.on_presence_message("3", raw).await.unwrap();

        assert_eq!(store.load_status("3").await.unwrap().unwrap().source_identity, MAC);
    }

    #[tokio::test]
    async fn subject_mismatch_rejected() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());

        let err = sync.on_presence_message("3", &payload("4", true, 1)).await.unwrap_err();

        assert!(matches!(err, SyncError::SubjectMismatch { .. }));
        assert!(err.is_malformed());
        assert!(store.list_status().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2, true));
        let (sync, notifier) = synchronizer(store.clone());

        let outcome = sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap();

        assert!(matches!(outcome, Outcome::Applied { changed: true, .. }));
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhausted() {
        let store = Arc::new(FlakyStore::new(10, true));
        let (sync, notifier) = synchronizer(store.clone());

        let err = sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap_err();

        match err {
            SyncError::PersistenceExhausted {
                subject_id, attempts, ..
            } => {
                assert_eq!(subject_id, "3");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected PersistenceExhausted, got {other:?}"),
        }
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
        assert_eq!(notifier.count(), 0);
        assert_eq!(store.load_status("3").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_between_attempts() {
        let store = Arc::new(FlakyStore::new(2, true));
        let (sync, _) = synchronizer(store);
        let start = tokio::time::Instant::now();

        sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn permanent_failure_not_retried() {
        let store = Arc::new(FlakyStore::new(1, false));
        let (sync, _) = synchronizer(store.clone());

        let err = sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap_err();

        assert!(matches!(err, SyncError::Storage(StorageError::Backend(_))));
        assert!(!err.is_malformed());
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn later_event_heals_after_abandoned_update() {
        let store = Arc::new(FlakyStore::new(1, false));
        let (sync, _) = synchronizer(store.clone());

        sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap_err();
        sync.on_presence_message("3", &payload("3", true, 61_000)).await.unwrap();

        let record = store.load_status("3").await.unwrap().unwrap();
        assert!(record.present);
        assert_eq!(record.updated_at, 61_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_keep_newest() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());
        let sync = Arc::new(sync);

        let mut tasks = Vec::new();
        for ts in (1..=50).rev() {
            let sync = Arc::clone(&sync);
            tasks.push(tokio::spawn(async move {
                let _ = sync.on_presence_message("3", &payload("3", ts % 2 == 0, ts)).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let record = store.load_status("3").await.unwrap().unwrap();
        assert_eq!(record.updated_at, 50);
        assert!(record.present);
        assert_eq!(sync.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn subject_locks_do_not_accumulate() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());

        for n in 0..100 {
            let subject = format!("tag-{n}");
            sync.on_presence_message(&subject, &payload(&subject, true, 1_000)).await.unwrap();
        }

        assert_eq!(store.list_status().await.unwrap().len(), 100);
        assert_eq!(sync.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn failed_update_releases_subject_lock() {
        let store = Arc::new(FlakyStore::new(1, false));
        let (sync, _) = synchronizer(store.clone());

        sync.on_presence_message("3", &payload("3", true, 1_000)).await.unwrap_err();

        assert_eq!(sync.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn waiting_update_keeps_lock_alive() {
        let store = Arc::new(MemoryStore::default());
        let (sync, _) = synchronizer(store.clone());

        let held = sync.subject_lock("3");
        let guard = held.lock().await;
        let sync = Arc::new(sync);
        let waiter = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.on_presence_message("3", &payload("3", true, 1_000)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(sync.tracked_locks(), 1);

        drop(guard);
        waiter.await.unwrap().unwrap();
        assert_eq!(sync.tracked_locks(), 1, "our clone still pins the entry");

        sync.release_subject_lock("3", held);
        assert_eq!(sync.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let store = Arc::new(MemoryStore::default());
        let (sync, notifier) = synchronizer(store.clone());

        sync.on_presence_message("3", &payload("3", true, 5_000)).await.unwrap();
        sync.on_presence_message("4", &payload("4", true, 1_000)).await.unwrap();

        assert_eq!(store.list_status().await.unwrap().len(), 2);
        assert_eq!(notifier.count(), 2);
    }
}
