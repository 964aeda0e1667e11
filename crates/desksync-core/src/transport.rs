//! Cross-process broadcast boundary.
//!
//! The OS-level notification primitive is abstracted behind
//! [`SignalTransport`]: a named-channel broadcast that loops back to every
//! subscribed process, *including the sender*. The host crate provides the
//! real signal-file implementation; [`MemoryTransport`] wires several
//! logical "processes" together inside one address space for tests and
//! single-window deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Errors raised at the broadcast boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Channel names are path-safe tokens; anything else is refused.
    #[error("invalid channel name {name:?}")]
    InvalidChannel {
        /// The offending name.
        name: String,
    },

    /// I/O error from the underlying primitive.
    #[error("signal bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope could not be encoded or decoded.
    #[error("signal envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Validates a channel name: lowercase alphanumerics, `-`, `_`, `.`.
///
/// Names become file stems in the signal-file transport, so the check is
/// enforced here at the boundary rather than trusted to callers.
///
/// # Errors
///
/// Returns [`TransportError::InvalidChannel`] for empty or non-token names.
pub fn validate_channel_name(name: &str) -> Result<(), TransportError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(TransportError::InvalidChannel {
            name: name.to_string(),
        })
    }
}

/// Cancellation capability returned by subscriptions.
///
/// Calling [`unsubscribe`](Self::unsubscribe) more than once is safe; only
/// the first call runs the teardown. Dropping the guard does *not*
/// unsubscribe — a subscriber that simply goes away is pruned lazily when
/// the next delivery finds its channel closed.
#[derive(Clone)]
pub struct SubscriptionGuard {
    inner: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl SubscriptionGuard {
    /// Wraps a teardown action.
    #[must_use]
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(teardown)))),
        }
    }

    /// A guard with no teardown, for subscriptions that need none.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancels the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        let action = self.inner.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
    }

    /// Whether the subscription is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

/// OS broadcast primitive: named channels, fan-out to all processes.
pub trait SignalTransport: Send + Sync {
    /// Broadcasts `payload` on `channel` to every subscribed process,
    /// including the sender.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the broadcast could not be handed to the
    /// OS primitive. Delivery itself is best-effort.
    fn broadcast(&self, channel: &str, payload: &JsonValue) -> Result<(), TransportError>;

    /// Registers `sink` for payloads arriving on `channel`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the subscription could not be
    /// registered.
    fn subscribe(
        &self,
        channel: &str,
        sink: UnboundedSender<JsonValue>,
    ) -> Result<SubscriptionGuard, TransportError>;
}

/// In-process transport hub.
///
/// Every clone shares the same subscriber table, so handing clones of one
/// hub to several runtimes makes them behave like processes on a common OS
/// bus: a broadcast from any of them reaches all of them, sender included.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    sinks: HashMap<String, Vec<(u64, UnboundedSender<JsonValue>)>>,
}

impl MemoryTransport {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalTransport for MemoryTransport {
    fn broadcast(&self, channel: &str, payload: &JsonValue) -> Result<(), TransportError> {
        validate_channel_name(channel)?;
        let mut state = self.inner.lock().unwrap();
        if let Some(sinks) = state.sinks.get_mut(channel) {
            // Prune subscribers whose receiving half is gone.
            sinks.retain(|(_, sink)| sink.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        sink: UnboundedSender<JsonValue>,
    ) -> Result<SubscriptionGuard, TransportError> {
        validate_channel_name(channel)?;
        let mut state = self.inner.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state
            .sinks
            .entry(channel.to_string())
            .or_default()
            .push((id, sink));

        let inner = Arc::clone(&self.inner);
        let channel = channel.to_string();
        Ok(SubscriptionGuard::new(move || {
            let mut state = inner.lock().unwrap();
            if let Some(sinks) = state.sinks.get_mut(&channel) {
                sinks.retain(|(sid, _)| *sid != id);
            }
        }))
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}
