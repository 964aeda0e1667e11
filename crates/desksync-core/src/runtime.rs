//! Per-process runtime context.
//!
//! One [`Runtime`] per window process owns the database handle, the event
//! bus, and every coordination service, wired together at `init` and torn
//! down at `close`. Subsystems receive the services they need instead of
//! reaching for module-level singletons.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::bus::{Channel, EventBus};
use crate::coordinator::{OwnershipCoordinator, PlatformHooks};
use crate::db::{Db, DbError};
use crate::registry::{RegistryError, RepoRegistry};
use crate::service::{ConfigService, ServiceError};
use crate::settings::Settings;
use crate::transport::SignalTransport;

/// Local event announcing that initialization finished.
pub const READY_EVENT: &str = "inited";

/// Everything the host platform layer provides.
#[derive(Clone)]
pub struct Platform {
    /// The cross-process broadcast primitive.
    pub transport: Arc<dyn SignalTransport>,
    /// The boundaries the ownership coordinator drives.
    pub hooks: PlatformHooks,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// Errors raised while bringing the runtime up.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The database could not be opened or initialized.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The config service failed to start.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The repository registry failed to load.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The per-process context object.
pub struct Runtime {
    settings: Settings,
    db: Db,
    bus: EventBus,
    service: Arc<ConfigService>,
    registry: Arc<RepoRegistry>,
    coordinator: OwnershipCoordinator,
    initialized: AtomicBool,
}

impl Runtime {
    /// Opens the database named by the settings and brings everything up.
    ///
    /// # Errors
    ///
    /// Returns an error if any subsystem fails to initialize.
    pub async fn init(settings: Settings, platform: Platform) -> Result<Self, RuntimeError> {
        let db = Db::open(&settings.db_path)?;
        Self::init_with_db(db, settings, platform).await
    }

    /// Brings everything up over an already-opened database handle.
    ///
    /// Initialization order matters: the service must listen for wake-ups
    /// before the registry's first load so no change slips between the two,
    /// and the `inited` event fires only after the registry has settled
    /// (including its stale-owner validation pass).
    ///
    /// # Errors
    ///
    /// Returns an error if any subsystem fails to initialize.
    pub async fn init_with_db(
        db: Db,
        settings: Settings,
        platform: Platform,
    ) -> Result<Self, RuntimeError> {
        let bus = EventBus::new(Arc::clone(&platform.transport));
        let service = ConfigService::start(db.clone(), bus.clone(), &settings)?;

        let registry = RepoRegistry::new(
            Arc::clone(&service),
            Arc::clone(&platform.hooks.probe),
            settings.liveness_concurrency,
        );
        registry.start().await?;

        let coordinator = OwnershipCoordinator::new(
            Arc::clone(&service),
            Arc::clone(&registry),
            platform.hooks,
            std::process::id(),
            settings.app_version.clone(),
        );

        let runtime = Self {
            settings,
            db,
            bus,
            service,
            registry,
            coordinator,
            initialized: AtomicBool::new(true),
        };

        // Local delivery cannot fail; subscribers not yet listening read the
        // initialized flag instead.
        let _ = runtime
            .bus
            .emit(&Channel::local(READY_EVENT), JsonValue::Null);

        Ok(runtime)
    }

    /// The settings this runtime was built with.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The shared database handle.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The per-process event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The config service.
    #[must_use]
    pub fn service(&self) -> &Arc<ConfigService> {
        &self.service
    }

    /// The repository registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RepoRegistry> {
        &self.registry
    }

    /// The ownership coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &OwnershipCoordinator {
        &self.coordinator
    }

    /// Whether initialization has completed and `close` has not run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Tears the runtime down: every outstanding subscription is released
    /// and the background tasks stop. The database handle closes when the
    /// runtime is dropped.
    pub fn close(&self) {
        self.registry.close();
        self.service.close();
        self.initialized.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{AutoConfirm, testing::{MemoryScaffold, RecordingFocus}};
    use crate::probe::StaticProbe;
    use crate::transport::MemoryTransport;

    fn platform() -> Platform {
        Platform {
            transport: Arc::new(MemoryTransport::new()),
            hooks: PlatformHooks {
                probe: Arc::new(StaticProbe::alive_all()),
                focus: Arc::new(RecordingFocus::new()),
                scaffold: Arc::new(MemoryScaffold::new()),
                prompt: Arc::new(AutoConfirm(true)),
            },
        }
    }

    #[tokio::test]
    async fn init_then_close_flips_the_readiness_flag() {
        let db = Db::in_memory().unwrap();
        let runtime = Runtime::init_with_db(db, Settings::default(), platform())
            .await
            .unwrap();
        assert!(runtime.is_initialized());

        runtime.close();
        assert!(!runtime.is_initialized());
    }

    #[tokio::test]
    async fn init_opens_the_database_at_the_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            db_path: dir.path().join("app.db"),
            ..Settings::default()
        };
        let runtime = Runtime::init(settings, platform()).await.unwrap();
        assert!(dir.path().join("app.db").exists());
        runtime.close();
    }
}
