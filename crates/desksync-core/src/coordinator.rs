//! Ownership coordinator: who gets to open a repository.
//!
//! The persisted `owner` field is the lock table. Resolution is optimistic:
//! read the claim, decide, and never commit a second claim once a live owner
//! is seen. A second process asking for an already-open repository does not
//! steal it — it asks the owner to bring itself to the foreground and stays
//! closed. A claim left behind by a crashed process is detected through the
//! liveness boundary, reset, and reclaimed without manual cleanup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::probe::ProcessProbe;
use crate::registry::{Owner, RepoRegistry, Repository, RegistryError};
use crate::service::ConfigService;
use crate::store::StoreError;
use crate::time;
use crate::BoxFuture;

/// Singleton key remembering the most recently opened repository.
pub const RECENT_KEY: &str = "recent";

/// Errors raised by the project-scaffolding boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScaffoldError {
    /// Filesystem error while reading or writing project metadata.
    #[error("project metadata I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata document malformed.
    #[error("project metadata malformed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Foreground-request boundary.
///
/// Answers whether the target process acknowledged and is expected to raise
/// its window. A `false` answer is logged but does not change the outcome:
/// once a live owner exists the local process must not open the repository.
pub trait FocusRequester: Send + Sync {
    /// Asks the process holding `pid` to bring itself to the foreground.
    fn request_foreground(&self, pid: u32) -> BoxFuture<'_, bool>;
}

/// On-disk project scaffolding boundary.
pub trait ProjectScaffold: Send + Sync {
    /// Reads the repository metadata stored under `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or malformed metadata.
    fn read_meta(&self, path: &Path) -> Result<Option<Repository>, ScaffoldError>;

    /// Whether the directory already contains entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    fn is_populated(&self, path: &Path) -> Result<bool, ScaffoldError>;

    /// Creates the scaffold directories and persists the metadata document.
    ///
    /// # Errors
    ///
    /// Returns an error if the scaffold cannot be written.
    fn create(&self, repo: &Repository) -> Result<(), ScaffoldError>;
}

/// Confirmation boundary for creating a project in a non-empty directory.
pub trait CreatePrompt: Send + Sync {
    /// Whether the user agrees to scaffold a project at `path`.
    fn confirm_create(&self, path: &Path) -> BoxFuture<'_, bool>;
}

/// Prompt with a fixed answer, for tests and headless runs.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl CreatePrompt for AutoConfirm {
    fn confirm_create(&self, _path: &Path) -> BoxFuture<'_, bool> {
        let answer = self.0;
        Box::pin(async move { answer })
    }
}

/// Terminal state of one resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This process now holds the repository.
    LocalOpen,
    /// A live peer holds it and was asked to come to the foreground.
    RemoteFocused {
        /// Pid of the holding process.
        owner: u32,
    },
}

/// Outcome of opening a path, which may involve the creation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Opened locally.
    Opened,
    /// A live peer holds the repository and was asked to the foreground.
    Focused {
        /// Pid of the holding process.
        owner: u32,
    },
    /// The user declined to scaffold a project in a populated directory.
    Declined,
}

impl From<Resolution> for OpenOutcome {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::LocalOpen => Self::Opened,
            Resolution::RemoteFocused { owner } => Self::Focused { owner },
        }
    }
}

/// Errors raised during resolution.
///
/// A failure to persist the claim itself is the denied terminal: the caller
/// surfaces it and the repository stays closed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordError {
    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Config store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Scaffolding boundary failed.
    #[error(transparent)]
    Scaffold(#[from] ScaffoldError),
}

/// The host-provided boundary objects the coordinator drives.
#[derive(Clone)]
pub struct PlatformHooks {
    /// Liveness queries.
    pub probe: Arc<dyn ProcessProbe>,
    /// Foreground requests.
    pub focus: Arc<dyn FocusRequester>,
    /// Project metadata on disk.
    pub scaffold: Arc<dyn ProjectScaffold>,
    /// Creation confirmation.
    pub prompt: Arc<dyn CreatePrompt>,
}

impl std::fmt::Debug for PlatformHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformHooks").finish_non_exhaustive()
    }
}

/// Value document stored under [`RECENT_KEY`].
#[derive(Debug, Serialize, Deserialize)]
struct RecentValue {
    id: String,
    name: String,
    path: String,
    #[serde(default)]
    ver: String,
}

/// Arbitrates exclusive repository ownership for one process.
pub struct OwnershipCoordinator {
    service: Arc<ConfigService>,
    registry: Arc<RepoRegistry>,
    hooks: PlatformHooks,
    pid: u32,
    version: String,
    current: Mutex<Option<String>>,
}

impl OwnershipCoordinator {
    /// Creates a coordinator acting as process `pid`.
    #[must_use]
    pub fn new(
        service: Arc<ConfigService>,
        registry: Arc<RepoRegistry>,
        hooks: PlatformHooks,
        pid: u32,
        version: impl Into<String>,
    ) -> Self {
        Self {
            service,
            registry,
            hooks,
            pid,
            version: version.into(),
            current: Mutex::new(None),
        }
    }

    /// The repository this process currently holds, if any.
    #[must_use]
    pub fn current(&self) -> Option<Repository> {
        let id = self.current.lock().unwrap().clone()?;
        self.registry.find(&id)
    }

    /// Resolves an open attempt for `repo`.
    ///
    /// * Already held by this process → [`Resolution::LocalOpen`], no writes.
    /// * Unclaimed → claim it (persisted with notification) → `LocalOpen`.
    /// * Held by a live peer → one foreground request, no owner write →
    ///   [`Resolution::RemoteFocused`].
    /// * Held by a dead peer → silent owner reset, then resolved again as
    ///   unclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error when persisting the claim (or the stale-owner reset)
    /// fails; the repository stays closed.
    pub async fn resolve(&self, repo: &Repository) -> Result<Resolution, CoordError> {
        // Trust the registry over the caller's snapshot when it has one.
        let mut owner = self
            .registry
            .find(&repo.id)
            .map_or(repo.owner, |fresh| fresh.owner);

        loop {
            match owner {
                Owner::ClaimedBy(pid) if pid == self.pid => {
                    *self.current.lock().unwrap() = Some(repo.id.clone());
                    return Ok(Resolution::LocalOpen);
                }
                Owner::Unclaimed => {
                    self.claim(repo)?;
                    *self.current.lock().unwrap() = Some(repo.id.clone());
                    self.refresh_recent(repo);
                    return Ok(Resolution::LocalOpen);
                }
                Owner::ClaimedBy(other) => {
                    if self.hooks.probe.is_alive(other).await {
                        let acknowledged = self.hooks.focus.request_foreground(other).await;
                        if !acknowledged {
                            tracing::warn!(owner = other, id = %repo.id, "foreground request not acknowledged");
                        }
                        return Ok(Resolution::RemoteFocused { owner: other });
                    }

                    tracing::info!(owner = other, id = %repo.id, "owner process is dead, reclaiming");
                    let fixed = self
                        .registry
                        .update_quiet(&repo.id, |r| r.owner = Owner::Unclaimed)?;
                    owner = fixed.owner;
                }
            }
        }
    }

    /// Opens the repository living at `path`, scaffolding a new one if the
    /// path has never been a project.
    ///
    /// # Errors
    ///
    /// Returns scaffold, registry, or claim-persistence errors.
    pub async fn open_path(&self, path: &Path) -> Result<OpenOutcome, CoordError> {
        if let Some(repo) = self.registry.find_by_path(path) {
            return Ok(self.resolve(&repo).await?.into());
        }

        let repo = match self.hooks.scaffold.read_meta(path)? {
            Some(existing) => existing,
            None => {
                if self.hooks.scaffold.is_populated(path)?
                    && !self.hooks.prompt.confirm_create(path).await
                {
                    return Ok(OpenOutcome::Declined);
                }

                let repo = Repository {
                    id: Uuid::new_v4().to_string(),
                    name: derive_name(path),
                    path: path.to_path_buf(),
                    version: self.version.clone(),
                    created_at: time::now_secs(),
                    owner: Owner::Unclaimed,
                };
                self.hooks.scaffold.create(&repo)?;
                repo
            }
        };

        // A meta file can describe a repository this database has never
        // seen: a fresh profile, or a project directory copied from another
        // machine. Register it before resolving.
        if self.registry.find(&repo.id).is_none() {
            self.registry.add(repo.clone())?;
        }

        Ok(self.resolve(&repo).await?.into())
    }

    /// Boot-time open: the explicitly requested path wins; otherwise, when
    /// no repository is held by any process, the most recent one is
    /// reopened. Returns `None` when nothing was attempted.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`open_path`](Self::open_path).
    pub async fn startup(&self, arg: Option<&Path>) -> Result<Option<OpenOutcome>, CoordError> {
        let mut outcome = None;
        if let Some(path) = arg {
            outcome = Some(self.open_path(path).await?);
        }

        let opened_locally = matches!(outcome, Some(OpenOutcome::Opened));
        if !opened_locally && self.registry.claimed_count() == 0 {
            if let Some(record) = self.service.get_by_key(RECENT_KEY)?.into_iter().next() {
                match serde_json::from_value::<RecentValue>(record.value) {
                    Ok(recent) => {
                        if let Some(repo) = self.registry.find(&recent.id) {
                            return Ok(Some(self.resolve(&repo).await?.into()));
                        }
                        // Registry is fresh but the path may still exist.
                        return Ok(Some(self.open_path(Path::new(&recent.path)).await?));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "recent record malformed, ignoring");
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Writes the claim. An id the registry has never seen is registered
    /// already claimed.
    fn claim(&self, repo: &Repository) -> Result<(), CoordError> {
        let pid = self.pid;
        match self.registry.update(&repo.id, |r| r.owner = Owner::ClaimedBy(pid)) {
            Ok(_) => Ok(()),
            Err(RegistryError::NotFound { .. }) => {
                let mut claimed = repo.clone();
                claimed.owner = Owner::ClaimedBy(pid);
                self.registry.add(claimed)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Refreshes the `"recent"` record. Best-effort: a failure here must not
    /// undo a successful open.
    fn refresh_recent(&self, repo: &Repository) {
        let value = serde_json::json!({
            "id": repo.id,
            "name": repo.name,
            "path": repo.path.to_string_lossy(),
            "ver": repo.version,
        });
        if let Err(err) = self.service.upsert_by_key(RECENT_KEY, &value, true) {
            tracing::warn!(error = %err, "failed to record recent project");
        }
    }
}

impl std::fmt::Debug for OwnershipCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipCoordinator")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

fn derive_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Test doubles shared by the unit suite below and the integration tests.
#[doc(hidden)]
pub mod testing {
    use std::collections::HashMap;

    use super::{
        BoxFuture, FocusRequester, Path, PathBuf, ProjectScaffold, Repository, ScaffoldError,
    };
    use std::sync::Mutex;

    /// Focus requester that records every call.
    #[derive(Debug, Default)]
    pub struct RecordingFocus {
        calls: Mutex<Vec<u32>>,
        refuse: bool,
    }

    impl RecordingFocus {
        /// A requester that acknowledges every request.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A requester whose targets never acknowledge.
        #[must_use]
        pub fn refusing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                refuse: true,
            }
        }

        /// Pids that were asked to come to the foreground, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FocusRequester for RecordingFocus {
        fn request_foreground(&self, pid: u32) -> BoxFuture<'_, bool> {
            self.calls.lock().unwrap().push(pid);
            let acked = !self.refuse;
            Box::pin(async move { acked })
        }
    }

    /// Scaffold kept entirely in memory.
    #[derive(Debug, Default)]
    pub struct MemoryScaffold {
        meta: Mutex<HashMap<PathBuf, Repository>>,
        populated: Mutex<Vec<PathBuf>>,
        created: Mutex<Vec<String>>,
    }

    impl MemoryScaffold {
        /// An empty scaffold.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a metadata document for `path`.
        pub fn seed_meta(&self, repo: Repository) {
            self.meta.lock().unwrap().insert(repo.path.clone(), repo);
        }

        /// Marks `path` as containing entries.
        pub fn mark_populated(&self, path: impl Into<PathBuf>) {
            self.populated.lock().unwrap().push(path.into());
        }

        /// Ids passed to [`ProjectScaffold::create`], in order.
        #[must_use]
        pub fn created(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }
    }

    impl ProjectScaffold for MemoryScaffold {
        fn read_meta(&self, path: &Path) -> Result<Option<Repository>, ScaffoldError> {
            Ok(self.meta.lock().unwrap().get(path).cloned())
        }

        fn is_populated(&self, path: &Path) -> Result<bool, ScaffoldError> {
            Ok(self.populated.lock().unwrap().iter().any(|p| p == path))
        }

        fn create(&self, repo: &Repository) -> Result<(), ScaffoldError> {
            self.created.lock().unwrap().push(repo.id.clone());
            self.meta
                .lock()
                .unwrap()
                .insert(repo.path.clone(), repo.clone());
            Ok(())
        }
    }
}
