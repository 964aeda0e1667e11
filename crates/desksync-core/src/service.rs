//! Config service: mutation + change tracking + cross-process wake-ups.
//!
//! [`ConfigService`] is what subsystems talk to. It wraps the raw
//! [`ConfigStore`] so every mutation can leave a [`ChangeLedger`] entry
//! behind and wake the peer processes, and it owns this process's watermark:
//! on every wake-up it reads the ledger past the watermark, advances it, and
//! re-emits one local `cfgchanged:<key>` event per distinct key touched.
//!
//! Side-effect ordering is deliberate: the row mutation commits first, then
//! the ledger append, then the broadcast. Failures in that notification tail
//! are logged and swallowed — the data write must not be reported as failed
//! because the fan-out failed, since peers re-read everything at their next
//! boot anyway. Failures of the row mutation itself surface to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::bus::{BusError, Channel, EventBus, EventStream};
use crate::db::Db;
use crate::ledger::{self, ChangeLedger, LedgerError};
use crate::settings::Settings;
use crate::store::{ConfigRecord, ConfigStore, StoreError};
use crate::time;
use crate::transport::SubscriptionGuard;

/// Cross-process channel carrying the payload-free "config changed" wake-up.
pub const CFG_CHANGED_CHANNEL: &str = "cfgchanged";

/// Name of the local channel fired once per changed key.
#[must_use]
pub fn key_channel(key: &str) -> String {
    format!("cfgchanged:{key}")
}

/// Errors raised while starting or polling the service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// Row operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Shared-configuration service for one process.
pub struct ConfigService {
    store: ConfigStore,
    ledger: ChangeLedger,
    bus: EventBus,
    retention_secs: u64,
    /// Timestamp of the newest ledger entry this process has processed.
    watermark: AtomicU64,
    wake_guard: Mutex<Option<SubscriptionGuard>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigService {
    /// Builds the service, seeds the watermark, prunes the ledger, and
    /// starts listening for cross-process wake-ups.
    ///
    /// The watermark boots from the ledger's newest entry — not from zero —
    /// so a fresh process does not storm through re-reads of every change
    /// recorded before it existed. Pruning runs here and only here, never
    /// mid-poll: entries older than the retention window go.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or the wake-up
    /// subscription cannot be registered.
    pub fn start(db: Db, bus: EventBus, settings: &Settings) -> Result<Arc<Self>, ServiceError> {
        let service = Arc::new(Self {
            store: ConfigStore::new(db.clone()),
            ledger: ChangeLedger::new(db),
            bus,
            retention_secs: settings.change_retention_secs,
            watermark: AtomicU64::new(0),
            wake_guard: Mutex::new(None),
            poll_task: Mutex::new(None),
        });

        if let Some(latest) = service.ledger.latest()? {
            service.watermark.store(latest, Ordering::SeqCst);
            let cutoff = time::now_secs().saturating_sub(service.retention_secs);
            let removed = service.ledger.prune(cutoff)?;
            if removed > 0 {
                tracing::debug!(removed, "pruned change ledger");
            }
        }

        let mut stream = service
            .bus
            .listen(&Channel::cross(CFG_CHANGED_CHANNEL))?;
        *service.wake_guard.lock().unwrap() = Some(stream.guard());

        let poller = Arc::clone(&service);
        let task = tokio::spawn(async move {
            // The wake-up carries no payload; it only means "go look".
            while stream.recv().await.is_some() {
                if let Err(err) = poller.poll_changes() {
                    tracing::warn!(error = %err, "change poll failed");
                }
            }
        });
        *service.poll_task.lock().unwrap() = Some(task);

        Ok(service)
    }

    /// The bus this service emits on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribes to the local per-key change channel for `key`.
    ///
    /// # Errors
    ///
    /// Local subscriptions cannot fail today; the `Result` mirrors
    /// [`EventBus::listen`].
    pub fn listen_key(&self, key: &str) -> Result<EventStream, BusError> {
        self.bus.listen(&Channel::local(key_channel(key)))
    }

    /// Current watermark, Unix seconds.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Singleton upsert. See [`ConfigStore::upsert_by_key`].
    ///
    /// # Errors
    ///
    /// Propagates row-mutation errors; notification failures are swallowed.
    pub fn upsert_by_key(
        &self,
        key: &str,
        value: &JsonValue,
        notify: bool,
    ) -> Result<String, StoreError> {
        let id = self.store.upsert_by_key(key, value)?;
        if notify {
            self.record_change(key, Some(&id));
        }
        Ok(id)
    }

    /// Upsert by caller-allocated id. See [`ConfigStore::upsert_by_id`].
    ///
    /// # Errors
    ///
    /// Propagates row-mutation errors; notification failures are swallowed.
    pub fn upsert_by_id(
        &self,
        id: &str,
        key: &str,
        value: &JsonValue,
        notify: bool,
    ) -> Result<(), StoreError> {
        self.store.upsert_by_id(id, key, value)?;
        if notify {
            self.record_change(key, Some(id));
        }
        Ok(())
    }

    /// Unconditional insert. See [`ConfigStore::insert`].
    ///
    /// # Errors
    ///
    /// Propagates row-mutation errors; notification failures are swallowed.
    pub fn insert(&self, key: &str, value: &JsonValue, notify: bool) -> Result<String, StoreError> {
        let id = self.store.insert(key, value)?;
        if notify {
            self.record_change(key, Some(&id));
        }
        Ok(id)
    }

    /// Removes a row. The key is needed for the change entry because the row
    /// is already gone by the time peers hear about it.
    ///
    /// # Errors
    ///
    /// Propagates row-mutation errors; notification failures are swallowed.
    pub fn remove(&self, id: &str, key: &str, notify: bool) -> Result<(), StoreError> {
        self.store.remove(id)?;
        if notify {
            self.record_change(key, Some(id));
        }
        Ok(())
    }

    /// Reads every row under `key`.
    ///
    /// # Errors
    ///
    /// See [`ConfigStore::get_by_key`].
    pub fn get_by_key(&self, key: &str) -> Result<Vec<ConfigRecord>, StoreError> {
        self.store.get_by_key(key)
    }

    /// Reads a row by id.
    ///
    /// # Errors
    ///
    /// See [`ConfigStore::get_by_id`].
    pub fn get_by_id(&self, id: &str) -> Result<Option<ConfigRecord>, StoreError> {
        self.store.get_by_id(id)
    }

    /// Reads the ledger past the watermark and re-emits local events.
    ///
    /// Emits `cfgchanged:<key>` once per distinct key in the batch, then
    /// advances the watermark to the final entry's timestamp. Returns the
    /// distinct keys for observability.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn poll_changes(&self) -> Result<Vec<String>, LedgerError> {
        let entries = self.ledger.since(self.watermark())?;
        let Some(last) = entries.last() else {
            return Ok(Vec::new());
        };
        let last_ctime = last.ctime;

        let keys = ledger::distinct_keys(&entries);
        for key in &keys {
            // Local delivery cannot fail.
            let _ = self
                .bus
                .emit(&Channel::local(key_channel(key)), serde_json::json!({ "key": key }));
        }
        self.watermark.store(last_ctime, Ordering::SeqCst);
        Ok(keys)
    }

    /// Stops the wake-up listener and releases its subscription.
    pub fn close(&self) {
        if let Some(guard) = self.wake_guard.lock().unwrap().take() {
            guard.unsubscribe();
        }
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Appends the change entry and wakes the peers.
    ///
    /// Both steps are best-effort: a failure here is logged and swallowed
    /// because the row mutation has already committed and peers converge
    /// through their boot-time full reload. The broadcast is skipped when
    /// the append failed — a wake-up with nothing to find would be noise.
    fn record_change(&self, key: &str, cfgid: Option<&str>) {
        let now = time::now_secs();
        match self.ledger.append(key, cfgid, now) {
            Ok(()) => {
                // Own changes are already applied locally; advancing the
                // watermark keeps the loop-back poll from re-reading them.
                self.watermark.store(now, Ordering::SeqCst);
                if let Err(err) = self.bus.emit(&Channel::cross(CFG_CHANGED_CHANNEL), JsonValue::Null)
                {
                    tracing::warn!(key, error = %err, "change broadcast failed, peers will catch up at next boot");
                }
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "change ledger append failed, peers will catch up at next boot");
            }
        }
    }
}

impl std::fmt::Debug for ConfigService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigService")
            .field("watermark", &self.watermark())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{MemoryTransport, SignalTransport};

    fn fixture() -> (Arc<ConfigService>, Db, Arc<MemoryTransport>) {
        let db = Db::in_memory().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let bus = EventBus::new(transport.clone());
        let service = ConfigService::start(db.clone(), bus, &Settings::default()).unwrap();
        (service, db, transport)
    }

    #[tokio::test]
    async fn notify_appends_ledger_entry_and_broadcasts() {
        let (service, db, transport) = fixture();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.subscribe(CFG_CHANGED_CHANNEL, tx).unwrap();

        service
            .upsert_by_key("lang", &json!({"lang": "en"}), true)
            .unwrap();

        // The broadcast carries no payload.
        assert_eq!(rx.recv().await, Some(JsonValue::Null));

        let ledger = ChangeLedger::new(db);
        let entries = ledger.since(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "lang");
        assert!(entries[0].cfgid.is_some());
    }

    #[tokio::test]
    async fn silent_mutations_leave_no_trace() {
        let (service, db, _transport) = fixture();

        service
            .upsert_by_key("light", &json!({"mode": "dark"}), false)
            .unwrap();

        assert!(ChangeLedger::new(db).since(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_emits_once_per_distinct_key_and_advances_watermark() {
        let (service, db, _transport) = fixture();
        let ledger = ChangeLedger::new(db);
        ledger.append("a", None, 10).unwrap();
        ledger.append("a", None, 15).unwrap();
        ledger.append("b", None, 20).unwrap();

        let mut a_events = service.listen_key("a").unwrap();
        let mut b_events = service.listen_key("b").unwrap();

        let keys = service.poll_changes().unwrap();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(service.watermark(), 20);

        assert_eq!(a_events.recv().await, Some(json!({"key": "a"})));
        assert_eq!(b_events.recv().await, Some(json!({"key": "b"})));

        // "a" changed twice in the batch but fires exactly once: the only
        // queued payload per stream is the one consumed above.
        let extra = tokio::time::timeout(std::time::Duration::from_millis(50), a_events.recv()).await;
        assert!(extra.is_err(), "key event must fire once per batch");
    }

    #[tokio::test]
    async fn second_poll_without_changes_is_empty() {
        let (service, db, _transport) = fixture();
        ChangeLedger::new(db).append("a", None, 10).unwrap();

        assert_eq!(service.poll_changes().unwrap().len(), 1);
        assert!(service.poll_changes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn watermark_boots_from_newest_entry_not_zero() {
        let db = Db::in_memory().unwrap();
        let ledger = ChangeLedger::new(db.clone());
        let now = crate::time::now_secs();
        ledger.append("lang", None, now - 30).unwrap();
        ledger.append("light", None, now - 5).unwrap();

        let bus = EventBus::new(Arc::new(MemoryTransport::new()));
        let service = ConfigService::start(db, bus, &Settings::default()).unwrap();
        assert_eq!(service.watermark(), now - 5);
        assert!(service.poll_changes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn startup_prunes_entries_past_retention() {
        let db = Db::in_memory().unwrap();
        let ledger = ChangeLedger::new(db.clone());
        let now = crate::time::now_secs();
        ledger.append("ancient", None, now - 10_000).unwrap();
        ledger.append("fresh", None, now).unwrap();

        let bus = EventBus::new(Arc::new(MemoryTransport::new()));
        let _service = ConfigService::start(db.clone(), bus, &Settings::default()).unwrap();

        let remaining = ChangeLedger::new(db).since(0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "fresh");
    }

    #[tokio::test]
    async fn row_write_survives_ledger_failure_and_converges_at_next_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");

        {
            let db = Db::open(&path).unwrap();
            // Sabotage the notification tail only.
            db.conn().execute_batch("DROP TABLE change").unwrap();

            let bus = EventBus::new(Arc::new(MemoryTransport::new()));
            let service = ConfigService {
                store: ConfigStore::new(db.clone()),
                ledger: ChangeLedger::new(db),
                bus,
                retention_secs: 3600,
                watermark: AtomicU64::new(0),
                wake_guard: Mutex::new(None),
                poll_task: Mutex::new(None),
            };

            // The primary mutation must not be reported as failed.
            let id = service
                .upsert_by_key("lang", &json!({"lang": "es"}), true)
                .unwrap();
            assert_eq!(service.get_by_id(&id).unwrap().unwrap().value, json!({"lang": "es"}));
        }

        // Next boot re-creates the schema; a full read sees the row even
        // though no change entry was ever written.
        let db = Db::open(&path).unwrap();
        let bus = EventBus::new(Arc::new(MemoryTransport::new()));
        let service = ConfigService::start(db, bus, &Settings::default()).unwrap();
        let rows = service.get_by_key("lang").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, json!({"lang": "es"}));
        service.close();
    }

    #[tokio::test]
    async fn wake_up_triggers_poll_in_the_listening_process() {
        // Two services sharing one database and one transport behave like
        // two window processes.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let transport = Arc::new(MemoryTransport::new());

        let writer = ConfigService::start(
            Db::open(&path).unwrap(),
            EventBus::new(transport.clone()),
            &Settings::default(),
        )
        .unwrap();
        let reader = ConfigService::start(
            Db::open(&path).unwrap(),
            EventBus::new(transport.clone()),
            &Settings::default(),
        )
        .unwrap();

        let mut events = reader.listen_key("light").unwrap();
        writer
            .upsert_by_key("light", &json!({"mode": "dark"}), true)
            .unwrap();

        let payload = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("reader never observed the change");
        assert_eq!(payload, Some(json!({"key": "light"})));

        writer.close();
        reader.close();
    }
}
