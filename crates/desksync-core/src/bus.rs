//! Event bus spanning one process, bridged to the cross-process transport.
//!
//! Two address spaces of events exist and the difference is load-bearing:
//! local events reach only this process's subscribers, cross-process events
//! ride the OS broadcast primitive and come back to *every* process,
//! including the sender. The address space is an explicit [`ChannelKind`]
//! tag carried on every [`Channel`] value and checked at the API boundary —
//! never inferred from the shape of the name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::transport::{SignalTransport, SubscriptionGuard, TransportError};

/// Which address space a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Delivered synchronously to subscribers in this process only.
    Local,
    /// Broadcast via the OS primitive to all processes, sender included.
    CrossProcess,
}

/// A named event channel in one of the two address spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Address space of the channel.
    pub kind: ChannelKind,
    /// Channel name.
    pub name: String,
}

impl Channel {
    /// A local (in-process) channel.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::Local,
            name: name.into(),
        }
    }

    /// A cross-process channel.
    #[must_use]
    pub fn cross(name: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::CrossProcess,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ChannelKind::Local => write!(f, "local:{}", self.name),
            ChannelKind::CrossProcess => write!(f, "cross:{}", self.name),
        }
    }
}

/// Errors raised by bus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The cross-process transport refused the operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A bounded wait elapsed without the event arriving.
    #[error("timed out after {waited:?} waiting for {channel}")]
    Timeout {
        /// Channel that stayed silent.
        channel: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// The subscription closed before a value arrived.
    #[error("channel {channel} closed before an event arrived")]
    Closed {
        /// Channel whose stream ended.
        channel: String,
    },
}

/// A live subscription: a stream of payloads plus its cancellation handle.
pub struct EventStream {
    channel: Channel,
    receiver: UnboundedReceiver<JsonValue>,
    guard: SubscriptionGuard,
}

impl EventStream {
    /// Receives the next payload, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.receiver.recv().await
    }

    /// Cancels the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        self.guard.unsubscribe();
    }

    /// A clone of the cancellation handle, detachable from the stream.
    #[must_use]
    pub fn guard(&self) -> SubscriptionGuard {
        self.guard.clone()
    }

    /// The channel this stream listens on.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct LocalState {
    next_id: u64,
    subscribers: HashMap<String, Vec<(u64, UnboundedSender<JsonValue>)>>,
}

/// The per-process event bus.
///
/// Clones share one subscriber table and one transport handle.
#[derive(Clone)]
pub struct EventBus {
    local: Arc<Mutex<LocalState>>,
    transport: Arc<dyn SignalTransport>,
}

impl EventBus {
    /// Creates a bus bridged to the given cross-process transport.
    #[must_use]
    pub fn new(transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            local: Arc::default(),
            transport,
        }
    }

    /// The cross-process transport this bus is bridged to.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn SignalTransport> {
        Arc::clone(&self.transport)
    }

    /// Emits a payload on a channel.
    ///
    /// Local channels deliver to in-process subscribers immediately;
    /// subscribers whose stream was dropped are pruned. Cross-process
    /// channels hand the payload to the transport and rely on the OS
    /// loop-back for delivery, so the sender's own subscription sees the
    /// event too.
    ///
    /// # Errors
    ///
    /// Returns a transport error for cross-process channels only; local
    /// delivery cannot fail.
    pub fn emit(&self, channel: &Channel, payload: JsonValue) -> Result<(), BusError> {
        match channel.kind {
            ChannelKind::Local => {
                let mut state = self.local.lock().unwrap();
                if let Some(subs) = state.subscribers.get_mut(&channel.name) {
                    subs.retain(|(_, sink)| sink.send(payload.clone()).is_ok());
                }
                Ok(())
            }
            ChannelKind::CrossProcess => {
                self.transport.broadcast(&channel.name, &payload)?;
                Ok(())
            }
        }
    }

    /// Subscribes to a channel.
    ///
    /// # Errors
    ///
    /// Returns a transport error if a cross-process subscription could not
    /// be registered.
    pub fn listen(&self, channel: &Channel) -> Result<EventStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = match channel.kind {
            ChannelKind::Local => {
                let mut state = self.local.lock().unwrap();
                let id = state.next_id;
                state.next_id += 1;
                state
                    .subscribers
                    .entry(channel.name.clone())
                    .or_default()
                    .push((id, tx));

                let local = Arc::clone(&self.local);
                let name = channel.name.clone();
                SubscriptionGuard::new(move || {
                    let mut state = local.lock().unwrap();
                    if let Some(subs) = state.subscribers.get_mut(&name) {
                        subs.retain(|(sid, _)| *sid != id);
                    }
                })
            }
            ChannelKind::CrossProcess => self.transport.subscribe(&channel.name, tx)?,
        };

        Ok(EventStream {
            channel: channel.clone(),
            receiver: rx,
            guard,
        })
    }

    /// Waits for a single event on `channel`, up to `bound`.
    ///
    /// Used as the readiness gate: a subsystem that must not proceed before
    /// a one-time signal arrives waits here, and an elapsed bound is a hard
    /// failure, not a silent continue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Timeout`] once `bound` elapses, or
    /// [`BusError::Closed`] if the subscription ends first.
    pub async fn await_event(
        &self,
        channel: &Channel,
        bound: Duration,
    ) -> Result<JsonValue, BusError> {
        let mut stream = self.listen(channel)?;
        let outcome = tokio::time::timeout(bound, stream.recv()).await;
        stream.unsubscribe();
        match outcome {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(BusError::Closed {
                channel: channel.to_string(),
            }),
            Err(_) => Err(BusError::Timeout {
                channel: channel.to_string(),
                waited: bound,
            }),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
