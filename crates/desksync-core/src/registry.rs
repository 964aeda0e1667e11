//! Repository registry: the typed view over the `"repository"` namespace.
//!
//! Each repository is one config row addressed by its own id. The registry
//! keeps an in-memory projection of all of them, refreshed wholesale
//! whenever `cfgchanged:repository` fires — read-all-then-replace, not
//! incremental patching; the batches are small.
//!
//! The `owner` field is the distributed mutual-exclusion flag: the pid of
//! the process currently holding the repository open, or unclaimed. A pid is
//! never trusted as-is — a crashed holder leaves a stale claim behind, so
//! the initial load liveness-checks every claimed owner (bounded fan-out)
//! and silently resets the dead ones. Incremental reloads skip the check to
//! bound its cost.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::bus::{BusError, Channel};
use crate::probe::ProcessProbe;
use crate::service::ConfigService;
use crate::store::{ConfigRecord, StoreError};
use crate::transport::SubscriptionGuard;

/// Namespace holding one row per repository.
pub const REPOSITORY_KEY: &str = "repository";

/// Local event fired after the projection is replaced wholesale.
pub const REPO_RESET_EVENT: &str = "repo.reset";

/// Local event fired after a repository is removed.
pub const REPO_REMOVED_EVENT: &str = "repo.removed";

/// Holder of a repository.
///
/// The persisted form is a bare integer with `0` meaning unclaimed; that
/// encoding exists only at the store boundary and is folded into this
/// variant on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Nobody holds the repository.
    Unclaimed,
    /// Held by the process with this pid.
    ClaimedBy(u32),
}

impl Owner {
    /// Decodes the persisted integer form.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        if raw == 0 {
            Self::Unclaimed
        } else {
            Self::ClaimedBy(raw)
        }
    }

    /// Encodes to the persisted integer form.
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Unclaimed => 0,
            Self::ClaimedBy(pid) => pid,
        }
    }

    /// Whether any process holds the repository.
    #[must_use]
    pub fn is_claimed(self) -> bool {
        matches!(self, Self::ClaimedBy(_))
    }

    /// The holding pid, if any.
    #[must_use]
    pub fn holder(self) -> Option<u32> {
        match self {
            Self::Unclaimed => None,
            Self::ClaimedBy(pid) => Some(pid),
        }
    }
}

/// One known repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Repository {
    /// Row id; also the repository's identity on disk.
    pub id: String,
    /// Display name, defaulted from the path's final segment at creation.
    pub name: String,
    /// Directory the repository lives in.
    pub path: PathBuf,
    /// Application version that created the record.
    pub version: String,
    /// Creation time, Unix seconds.
    pub created_at: u64,
    /// Current holder.
    pub owner: Owner,
}

/// Persisted value document under the `"repository"` key.
#[derive(Debug, Serialize, Deserialize)]
struct RepoValue {
    name: String,
    path: String,
    #[serde(default)]
    ver: String,
    #[serde(default)]
    owner: u32,
}

impl Repository {
    /// Decodes a config record, validating the owner encoding.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Codec`] if the value document does not have
    /// the repository shape.
    pub fn from_record(record: &ConfigRecord) -> Result<Self, RegistryError> {
        let value: RepoValue =
            serde_json::from_value(record.value.clone()).map_err(|source| RegistryError::Codec {
                id: record.id.clone(),
                source,
            })?;
        Ok(Self {
            id: record.id.clone(),
            name: value.name,
            path: PathBuf::from(value.path),
            version: value.ver,
            created_at: record.created_at,
            owner: Owner::from_raw(value.owner),
        })
    }

    /// Encodes the persisted value document.
    #[must_use]
    pub fn to_value(&self) -> JsonValue {
        serde_json::json!({
            "name": self.name,
            "path": self.path.to_string_lossy(),
            "ver": self.version,
            "owner": self.owner.as_raw(),
        })
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A targeted update named an id the registry does not know.
    #[error("repository {id:?} not found")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// A persisted repository document is malformed.
    #[error("repository record {id:?} malformed: {source}")]
    Codec {
        /// The offending row.
        id: String,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// The config store refused or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The reload subscription could not be registered.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// In-memory projection of every known repository.
pub struct RepoRegistry {
    service: Arc<ConfigService>,
    probe: Arc<dyn ProcessProbe>,
    liveness_cap: usize,
    repos: Mutex<Vec<Repository>>,
    selected: Mutex<Option<String>>,
    reload_guard: Mutex<Option<SubscriptionGuard>>,
    reload_task: Mutex<Option<JoinHandle<()>>>,
}

impl RepoRegistry {
    /// Creates an empty registry. Call [`start`](Self::start) to populate it
    /// and begin tracking changes.
    #[must_use]
    pub fn new(
        service: Arc<ConfigService>,
        probe: Arc<dyn ProcessProbe>,
        liveness_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            probe,
            liveness_cap: liveness_cap.max(1),
            repos: Mutex::new(Vec::new()),
            selected: Mutex::new(None),
            reload_guard: Mutex::new(None),
            reload_task: Mutex::new(None),
        })
    }

    /// Performs the initial owner-validated load and subscribes to
    /// `cfgchanged:repository` for wholesale reloads (without validation).
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load fails or the subscription cannot
    /// be registered.
    pub async fn start(self: &Arc<Self>) -> Result<(), RegistryError> {
        self.load(true).await?;

        let mut stream = self.service.listen_key(REPOSITORY_KEY)?;
        *self.reload_guard.lock().unwrap() = Some(stream.guard());

        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if let Err(err) = registry.load(false).await {
                    tracing::warn!(error = %err, "repository reload failed");
                }
            }
        });
        *self.reload_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Reads all repository rows and replaces the projection.
    ///
    /// With `validate_owners` every claimed owner is liveness-checked first
    /// (at most [`liveness_cap`](Self::new) checks in flight) and stale
    /// claims are reset and persisted — silently, with notification off, so
    /// the cleanup does not storm the peers.
    ///
    /// # Errors
    ///
    /// Returns an error if rows cannot be read or a stale-owner fix cannot
    /// be persisted.
    pub async fn load(&self, validate_owners: bool) -> Result<(), RegistryError> {
        let records = self.service.get_by_key(REPOSITORY_KEY)?;
        let mut repos = Vec::with_capacity(records.len());
        for record in &records {
            match Repository::from_record(record) {
                Ok(repo) => repos.push(repo),
                // One corrupt row must not brick every window; surface it in
                // the log and keep going.
                Err(err) => tracing::warn!(id = %record.id, error = %err, "skipping malformed repository record"),
            }
        }

        if validate_owners {
            repos = self.validate_owners(repos).await?;
        }

        self.set_all(repos);
        Ok(())
    }

    /// Current projection, in row order.
    #[must_use]
    pub fn all(&self) -> Vec<Repository> {
        self.repos.lock().unwrap().clone()
    }

    /// Looks up a repository by id.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<Repository> {
        self.repos.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }

    /// Looks up a repository by path.
    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<Repository> {
        self.repos
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.path == path)
            .cloned()
    }

    /// How many repositories are currently claimed by some process.
    #[must_use]
    pub fn claimed_count(&self) -> usize {
        self.repos
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.owner.is_claimed())
            .count()
    }

    /// Marks a repository as selected in this process's UI.
    pub fn set_selected(&self, id: impl Into<String>) {
        *self.selected.lock().unwrap() = Some(id.into());
    }

    /// The current selection, if it still resolves.
    #[must_use]
    pub fn selected(&self) -> Option<String> {
        self.selected.lock().unwrap().clone()
    }

    /// Adds a repository and persists it with notification on.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written.
    pub fn add(&self, repo: Repository) -> Result<(), RegistryError> {
        self.service
            .upsert_by_id(&repo.id, REPOSITORY_KEY, &repo.to_value(), true)?;
        self.repos.lock().unwrap().push(repo);
        Ok(())
    }

    /// Removes a repository, emits `repo.removed`, and persists the removal
    /// with notification on.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be deleted.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        self.service.remove(id, REPOSITORY_KEY, true)?;
        self.repos.lock().unwrap().retain(|r| r.id != id);
        {
            let mut selected = self.selected.lock().unwrap();
            if selected.as_deref() == Some(id) {
                *selected = None;
            }
        }
        let _ = self.service.bus().emit(
            &Channel::local(REPO_REMOVED_EVENT),
            serde_json::json!({ "id": id }),
        );
        Ok(())
    }

    /// Applies a mutation to a repository and persists it with notification
    /// on. Returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown ids, or the
    /// persistence error.
    pub fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Repository),
    ) -> Result<Repository, RegistryError> {
        self.update_inner(id, mutate, true)
    }

    /// Like [`update`](Self::update) but with notification off.
    ///
    /// Used for self-healing corrections (stale owners) that peers must not
    /// be woken up for.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update).
    pub(crate) fn update_quiet(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Repository),
    ) -> Result<Repository, RegistryError> {
        self.update_inner(id, mutate, false)
    }

    /// Releases the reload subscription and stops the reload task.
    pub fn close(&self) {
        if let Some(guard) = self.reload_guard.lock().unwrap().take() {
            guard.unsubscribe();
        }
        if let Some(task) = self.reload_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn update_inner(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Repository),
        notify: bool,
    ) -> Result<Repository, RegistryError> {
        let updated = {
            let mut repos = self.repos.lock().unwrap();
            let repo = repos
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
            mutate(repo);
            repo.clone()
        };
        self.service
            .upsert_by_id(&updated.id, REPOSITORY_KEY, &updated.to_value(), notify)?;
        Ok(updated)
    }

    /// Replaces the whole projection, clears a selection that no longer
    /// resolves, and announces the reset locally.
    pub fn set_all(&self, repos: Vec<Repository>) {
        let length = repos.len();
        {
            let mut selected = self.selected.lock().unwrap();
            if let Some(id) = selected.as_deref() {
                if !repos.iter().any(|r| r.id == id) {
                    *selected = None;
                }
            }
        }
        *self.repos.lock().unwrap() = repos;
        let _ = self.service.bus().emit(
            &Channel::local(REPO_RESET_EVENT),
            serde_json::json!({ "length": length }),
        );
    }

    /// Liveness-checks every claimed owner with bounded concurrency and
    /// resets the stale ones.
    async fn validate_owners(
        &self,
        mut repos: Vec<Repository>,
    ) -> Result<Vec<Repository>, RegistryError> {
        let semaphore = Arc::new(Semaphore::new(self.liveness_cap));
        let mut checks = JoinSet::new();

        for (index, repo) in repos.iter().enumerate() {
            if let Owner::ClaimedBy(pid) = repo.owner {
                let semaphore = Arc::clone(&semaphore);
                let probe = Arc::clone(&self.probe);
                checks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        // The semaphore is never closed; fail open.
                        return (index, true);
                    };
                    (index, probe.is_alive(pid).await)
                });
            }
        }

        let mut stale = Vec::new();
        while let Some(joined) = checks.join_next().await {
            if let Ok((index, alive)) = joined {
                if !alive {
                    stale.push(index);
                }
            }
        }

        for index in stale {
            let repo = &mut repos[index];
            tracing::info!(id = %repo.id, owner = repo.owner.as_raw(), "clearing stale repository owner");
            repo.owner = Owner::Unclaimed;
            self.service
                .upsert_by_id(&repo.id, REPOSITORY_KEY, &repo.to_value(), false)?;
        }

        Ok(repos)
    }
}

impl std::fmt::Debug for RepoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoRegistry")
            .field("repos", &self.repos.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bus::EventBus;
    use crate::db::Db;
    use crate::probe::StaticProbe;
    use crate::settings::Settings;
    use crate::transport::MemoryTransport;

    fn service() -> Arc<ConfigService> {
        let db = Db::in_memory().unwrap();
        let bus = EventBus::new(Arc::new(MemoryTransport::new()));
        ConfigService::start(db, bus, &Settings::default()).unwrap()
    }

    fn repo(id: &str, owner: Owner) -> Repository {
        Repository {
            id: id.to_string(),
            name: format!("repo {id}"),
            path: PathBuf::from(format!("/projects/{id}")),
            version: "0.3.1".to_string(),
            created_at: 1_700_000_000,
            owner,
        }
    }

    #[tokio::test]
    async fn owner_round_trips_through_the_raw_encoding() {
        assert_eq!(Owner::from_raw(0), Owner::Unclaimed);
        assert_eq!(Owner::from_raw(42), Owner::ClaimedBy(42));
        assert_eq!(Owner::ClaimedBy(42).as_raw(), 42);
        assert_eq!(Owner::Unclaimed.as_raw(), 0);
        assert_eq!(Owner::ClaimedBy(7).holder(), Some(7));
    }

    #[tokio::test]
    async fn add_persists_and_peers_shape_decodes() {
        let service = service();
        let registry = RepoRegistry::new(service.clone(), Arc::new(StaticProbe::alive_all()), 32);

        registry.add(repo("r1", Owner::Unclaimed)).unwrap();

        let records = service.get_by_key(REPOSITORY_KEY).unwrap();
        assert_eq!(records.len(), 1);
        let decoded = Repository::from_record(&records[0]).unwrap();
        assert_eq!(decoded.id, "r1");
        assert_eq!(decoded.owner, Owner::Unclaimed);
        assert_eq!(decoded.path, PathBuf::from("/projects/r1"));
    }

    #[tokio::test]
    async fn stale_owner_is_reset_and_persisted_on_validated_load() {
        let service = service();
        let probe = StaticProbe::with_live([1000]);
        let registry = RepoRegistry::new(service.clone(), Arc::new(probe), 32);

        service
            .upsert_by_id("live", REPOSITORY_KEY, &repo("live", Owner::ClaimedBy(1000)).to_value(), false)
            .unwrap();
        service
            .upsert_by_id("dead", REPOSITORY_KEY, &repo("dead", Owner::ClaimedBy(2000)).to_value(), false)
            .unwrap();

        registry.load(true).await.unwrap();

        assert_eq!(registry.find("live").unwrap().owner, Owner::ClaimedBy(1000));
        assert_eq!(registry.find("dead").unwrap().owner, Owner::Unclaimed);

        // The fix is persisted, not just cached.
        let record = service.get_by_id("dead").unwrap().unwrap();
        assert_eq!(Repository::from_record(&record).unwrap().owner, Owner::Unclaimed);

        // And persisted silently: no change entries were written.
        assert_eq!(service.watermark(), 0);
    }

    #[tokio::test]
    async fn unvalidated_load_trusts_recorded_owners() {
        let service = service();
        let probe = StaticProbe::with_live([]);
        let registry = RepoRegistry::new(service.clone(), Arc::new(probe), 32);

        service
            .upsert_by_id("r", REPOSITORY_KEY, &repo("r", Owner::ClaimedBy(9999)).to_value(), false)
            .unwrap();

        registry.load(false).await.unwrap();
        assert_eq!(registry.find("r").unwrap().owner, Owner::ClaimedBy(9999));
    }

    #[tokio::test]
    async fn replace_clears_a_selection_that_no_longer_resolves() {
        let service = service();
        let registry = RepoRegistry::new(service.clone(), Arc::new(StaticProbe::alive_all()), 32);

        registry.add(repo("keep", Owner::Unclaimed)).unwrap();
        registry.add(repo("drop", Owner::Unclaimed)).unwrap();
        registry.set_selected("drop");

        service.remove("drop", REPOSITORY_KEY, false).unwrap();
        registry.load(false).await.unwrap();

        assert_eq!(registry.selected(), None);
        assert!(registry.find("keep").is_some());
        assert!(registry.find("drop").is_none());
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let service = service();
        let registry = RepoRegistry::new(service, Arc::new(StaticProbe::alive_all()), 32);
        let err = registry.update("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped_not_fatal() {
        let service = service();
        let registry = RepoRegistry::new(service.clone(), Arc::new(StaticProbe::alive_all()), 32);

        service
            .upsert_by_id("good", REPOSITORY_KEY, &repo("good", Owner::Unclaimed).to_value(), false)
            .unwrap();
        service
            .upsert_by_id("bad", REPOSITORY_KEY, &json!({"unexpected": true}), false)
            .unwrap();

        registry.load(false).await.unwrap();
        assert_eq!(registry.all().len(), 1);
        assert!(registry.find("good").is_some());
    }

    #[tokio::test]
    async fn reload_fires_on_repository_change_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let transport = Arc::new(MemoryTransport::new());

        let svc_a = ConfigService::start(
            Db::open(&path).unwrap(),
            EventBus::new(transport.clone()),
            &Settings::default(),
        )
        .unwrap();
        let svc_b = ConfigService::start(
            Db::open(&path).unwrap(),
            EventBus::new(transport.clone()),
            &Settings::default(),
        )
        .unwrap();

        let reg_a = RepoRegistry::new(svc_a.clone(), Arc::new(StaticProbe::alive_all()), 32);
        let reg_b = RepoRegistry::new(svc_b.clone(), Arc::new(StaticProbe::alive_all()), 32);
        reg_a.start().await.unwrap();
        reg_b.start().await.unwrap();

        // B sees A's addition without touching the database itself.
        let mut reset_events = svc_b
            .bus()
            .listen(&Channel::local(REPO_RESET_EVENT))
            .unwrap();
        reg_a.add(repo("shared", Owner::Unclaimed)).unwrap();

        let payload = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            reset_events.recv(),
        )
        .await
        .expect("peer registry never reloaded");
        assert_eq!(payload, Some(json!({"length": 1})));
        assert!(reg_b.find("shared").is_some());

        reg_a.close();
        reg_b.close();
        svc_a.close();
        svc_b.close();
    }
}
