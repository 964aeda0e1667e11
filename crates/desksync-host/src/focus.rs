//! Foreground-request transport and dispatch.
//!
//! A process that finds a repository held by a live peer does not open it;
//! it broadcasts a foreground request on the `focus` channel. Every process
//! receives the broadcast, but only the one whose pid matches the target
//! acts on it — everyone else ignores a request that is not addressed to
//! them.

use std::sync::{Arc, Mutex};

use desksync_core::{BoxFuture, FocusRequester, SignalTransport, SubscriptionGuard, TransportError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cross-process channel carrying foreground requests.
pub const FOCUS_CHANNEL: &str = "focus";

/// Payload of a foreground request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusRequest {
    /// Pid of the process being asked to raise its window.
    pub target: u32,
}

/// [`FocusRequester`] that broadcasts over the signal transport.
pub struct TransportFocusRequester {
    transport: Arc<dyn SignalTransport>,
}

impl TransportFocusRequester {
    /// Creates a requester over the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn SignalTransport>) -> Self {
        Self { transport }
    }
}

impl FocusRequester for TransportFocusRequester {
    fn request_foreground(&self, pid: u32) -> BoxFuture<'_, bool> {
        let payload = serde_json::json!({ "target": pid });
        let outcome = self.transport.broadcast(FOCUS_CHANNEL, &payload);
        Box::pin(async move {
            match outcome {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(target = pid, error = %err, "foreground request broadcast failed");
                    false
                }
            }
        })
    }
}

impl std::fmt::Debug for TransportFocusRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFocusRequester").finish_non_exhaustive()
    }
}

/// Receives foreground requests and raises the window when addressed.
pub struct FocusListener {
    guard: Mutex<Option<SubscriptionGuard>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FocusListener {
    /// Subscribes to the focus channel. `on_raise` runs for every request
    /// whose target equals `own_pid`; requests for other pids are ignored.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be registered.
    pub fn start(
        transport: Arc<dyn SignalTransport>,
        own_pid: u32,
        on_raise: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, TransportError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = transport.subscribe(FOCUS_CHANNEL, tx)?;

        let task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                match serde_json::from_value::<FocusRequest>(payload) {
                    Ok(request) if request.target == own_pid => {
                        tracing::info!(pid = own_pid, "foreground request received, raising window");
                        on_raise();
                    }
                    Ok(request) => {
                        tracing::debug!(
                            target = request.target,
                            pid = own_pid,
                            "foreground request for another process, ignoring"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed foreground request");
                    }
                }
            }
        });

        Ok(Self {
            guard: Mutex::new(Some(guard)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Releases the subscription and stops the dispatch task.
    pub fn close(&self) {
        if let Some(guard) = self.guard.lock().unwrap().take() {
            guard.unsubscribe();
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for FocusListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocusListener").finish_non_exhaustive()
    }
}
