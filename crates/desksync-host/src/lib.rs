//! OS-facing boundary implementations for desksync.
//!
//! `desksync-core` coordinates against abstract boundaries; this crate
//! provides the Unix implementations: liveness via signal 0, cross-process
//! broadcast via a watched directory of signal files, foreground-request
//! dispatch filtered by pid, and project scaffolding on the real
//! filesystem.

use std::sync::Arc;
use std::time::Duration;

use desksync_core::{CreatePrompt, Platform, PlatformHooks, Settings, SignalTransport};

pub mod focus;
pub mod liveness;
pub mod scaffold;
pub mod signal;
pub mod telemetry;

pub use focus::{FocusListener, FocusRequest, TransportFocusRequester, FOCUS_CHANNEL};
pub use liveness::UnixProcessProbe;
pub use scaffold::DirScaffold;
pub use signal::{SignalFileTransport, SignalSetupError};
pub use telemetry::init_tracing;

/// Assembles the full Unix platform from the settings.
///
/// The returned [`Platform`] feeds straight into
/// [`Runtime::init`](desksync_core::Runtime::init). The prompt stays a
/// parameter because only the host application knows how to ask its user a
/// question.
///
/// # Errors
///
/// Returns an error if the signal bus directory cannot be prepared or
/// watched.
pub fn unix_platform(
    settings: &Settings,
    prompt: Arc<dyn CreatePrompt>,
) -> Result<Platform, SignalSetupError> {
    let transport: Arc<dyn SignalTransport> = Arc::new(SignalFileTransport::new(
        &settings.bus_dir,
        Duration::from_secs(settings.signal_ttl_secs),
    )?);

    Ok(Platform {
        transport: Arc::clone(&transport),
        hooks: PlatformHooks {
            probe: Arc::new(UnixProcessProbe),
            focus: Arc::new(TransportFocusRequester::new(transport)),
            scaffold: Arc::new(DirScaffold::default()),
            prompt,
        },
    })
}
