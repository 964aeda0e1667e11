//! Coordination core for desksync window processes.
//!
//! Several processes of one desktop application share a single `SQLite`
//! database of configuration rows. This crate keeps them coherent:
//!
//! - [`store`] holds the key/value rows, refusing ambiguous singleton
//!   writes instead of guessing.
//! - [`ledger`] records what changed and when, so peers catch up by
//!   watermark instead of re-reading everything.
//! - [`bus`] and [`transport`] carry the wake-ups: local events stay in
//!   process, cross-process events ride an OS broadcast that loops back to
//!   every process including the sender.
//! - [`registry`] projects the `"repository"` rows into typed records and
//!   heals stale ownership left behind by crashed processes.
//! - [`coordinator`] arbitrates exclusive opens: claim what is free, focus
//!   what is held, reclaim what is dead.
//! - [`runtime`] wires it all together per process with an explicit
//!   init/close lifecycle.
//!
//! The OS-facing halves of the boundaries (liveness, signal files, focus
//! dispatch, on-disk scaffolding) live in the companion `desksync-host`
//! crate.

pub mod bus;
pub mod coordinator;
pub mod db;
pub mod ledger;
pub mod prefs;
pub mod probe;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod settings;
pub mod store;
pub mod transport;

mod time;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the object-safe boundary traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use bus::{BusError, Channel, ChannelKind, EventBus, EventStream};
pub use coordinator::{
    AutoConfirm, CoordError, CreatePrompt, FocusRequester, OpenOutcome, OwnershipCoordinator,
    PlatformHooks, ProjectScaffold, Resolution, ScaffoldError, RECENT_KEY,
};
pub use db::{Db, DbError};
pub use ledger::{ChangeEntry, ChangeLedger, LedgerError};
pub use prefs::{LangPref, PrefError, ThemeMode, ThemePref, LANG_KEY, THEME_KEY};
pub use probe::{ProcessProbe, StaticProbe};
pub use registry::{
    Owner, RegistryError, RepoRegistry, Repository, REPOSITORY_KEY, REPO_REMOVED_EVENT,
    REPO_RESET_EVENT,
};
pub use runtime::{Platform, Runtime, RuntimeError, READY_EVENT};
pub use service::{ConfigService, ServiceError, CFG_CHANGED_CHANNEL};
pub use settings::{Settings, SettingsError};
pub use store::{ConfigRecord, ConfigStore, StoreError};
pub use transport::{
    MemoryTransport, SignalTransport, SubscriptionGuard, TransportError,
};
