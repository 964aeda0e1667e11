//! Signal-file cross-process transport.
//!
//! The OS primitive behind the broadcast boundary is nothing more than a
//! directory of files, one per channel, watched by every process. A
//! broadcast writes a timestamped JSON envelope into `<bus_dir>/<channel>.sig`;
//! the filesystem watcher in each process (the writer's included) turns the
//! modification into a delivery. Two guards keep the loop honest:
//!
//! - file metadata (size + mtime) is compared against a per-file cache, so
//!   platforms that report spurious or duplicated modification events do not
//!   double-deliver;
//! - envelopes older than a TTL are dropped as stale, so a process coming up
//!   long after a broadcast does not replay it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use desksync_core::transport::validate_channel_name;
use desksync_core::{SignalTransport, SubscriptionGuard, TransportError};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Filename extension of signal files.
const SIG_EXT: &str = "sig";

/// Debounce window for filesystem events.
const DEBOUNCE: Duration = Duration::from_millis(10);

/// Errors raised while setting the transport up.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignalSetupError {
    /// The bus directory could not be created.
    #[error("failed to prepare bus directory: {0}")]
    Io(#[from] std::io::Error),

    /// The filesystem watcher could not be started.
    #[error("failed to watch bus directory: {0}")]
    Watch(#[from] notify::Error),
}

/// What a signal file contains.
#[derive(Debug, Serialize, Deserialize)]
struct SignalEnvelope {
    /// When the broadcast happened, Unix seconds.
    ctime: u64,
    /// The broadcast payload; `null` for pure wake-ups.
    #[serde(default)]
    payload: JsonValue,
}

/// File metadata snapshot used to suppress duplicate events.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FileMetadata {
    size: u64,
    modified: SystemTime,
}

impl FileMetadata {
    fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

#[derive(Default)]
struct SinkTable {
    next_id: u64,
    sinks: HashMap<String, Vec<(u64, UnboundedSender<JsonValue>)>>,
}

struct Shared {
    dir: PathBuf,
    ttl: Duration,
    table: Mutex<SinkTable>,
    metadata_cache: Mutex<HashMap<PathBuf, FileMetadata>>,
}

/// [`SignalTransport`] over a watched directory of signal files.
///
/// The watcher lives as long as the transport; dropping the transport stops
/// it.
pub struct SignalFileTransport {
    shared: Arc<Shared>,
    _debouncer: Mutex<Debouncer<RecommendedWatcher, FileIdMap>>,
}

impl SignalFileTransport {
    /// Creates the bus directory if needed and starts watching it.
    ///
    /// `ttl` bounds how old an envelope may be and still be delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or watched.
    pub fn new(bus_dir: &Path, ttl: Duration) -> Result<Self, SignalSetupError> {
        fs::create_dir_all(bus_dir)?;

        let shared = Arc::new(Shared {
            dir: bus_dir.to_path_buf(),
            ttl,
            table: Mutex::new(SinkTable::default()),
            metadata_cache: Mutex::new(HashMap::new()),
        });

        let watched = Arc::clone(&shared);
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => handle_events(&watched, &events),
                Err(errors) => {
                    for err in errors {
                        tracing::error!(error = %err, "signal watcher error");
                    }
                }
            }
        })?;
        debouncer
            .watcher()
            .watch(bus_dir, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = %bus_dir.display(), "watching signal bus");

        Ok(Self {
            shared,
            _debouncer: Mutex::new(debouncer),
        })
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        self.shared.dir.join(format!("{channel}.{SIG_EXT}"))
    }
}

impl SignalTransport for SignalFileTransport {
    fn broadcast(&self, channel: &str, payload: &JsonValue) -> Result<(), TransportError> {
        validate_channel_name(channel)?;
        let envelope = SignalEnvelope {
            ctime: now_secs(),
            payload: payload.clone(),
        };
        let bytes = serde_json::to_vec(&envelope)?;
        fs::write(self.channel_path(channel), bytes)?;
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        sink: UnboundedSender<JsonValue>,
    ) -> Result<SubscriptionGuard, TransportError> {
        validate_channel_name(channel)?;
        let mut table = self.shared.table.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        table
            .sinks
            .entry(channel.to_string())
            .or_default()
            .push((id, sink));

        let shared = Arc::clone(&self.shared);
        let channel = channel.to_string();
        Ok(SubscriptionGuard::new(move || {
            let mut table = shared.table.lock().unwrap();
            if let Some(sinks) = table.sinks.get_mut(&channel) {
                sinks.retain(|(sid, _)| *sid != id);
            }
        }))
    }
}

impl std::fmt::Debug for SignalFileTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalFileTransport")
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

/// Debouncer callback: turn file modifications into channel deliveries.
fn handle_events(shared: &Shared, events: &[DebouncedEvent]) {
    let mut touched = Vec::new();
    for event in events {
        // Only data writes count; metadata-only events (permission changes,
        // reads bumping atime on some platforms) would loop.
        let relevant = matches!(
            event.event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        );
        if !relevant {
            continue;
        }
        for path in &event.event.paths {
            if path.extension().is_some_and(|ext| ext == SIG_EXT) && !touched.contains(path) {
                touched.push(path.clone());
            }
        }
    }

    for path in touched {
        deliver(shared, &path);
    }
}

fn deliver(shared: &Shared, path: &Path) {
    let Some(channel) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return;
    };

    let current = match FileMetadata::from_path(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cannot read signal file metadata");
            return;
        }
    };

    {
        let mut cache = shared.metadata_cache.lock().unwrap();
        if cache.get(path) == Some(&current) {
            tracing::debug!(channel, "signal metadata unchanged, skipping");
            return;
        }
        cache.insert(path.to_path_buf(), current);
    }

    let envelope: SignalEnvelope = match fs::read(path).map_err(TransportError::Io).and_then(|bytes| {
        serde_json::from_slice(&bytes).map_err(TransportError::Codec)
    }) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(channel, error = %err, "unreadable signal envelope");
            return;
        }
    };

    let age = now_secs().saturating_sub(envelope.ctime);
    if age > shared.ttl.as_secs() {
        tracing::debug!(channel, age, "stale signal envelope, dropping");
        return;
    }

    let mut table = shared.table.lock().unwrap();
    if let Some(sinks) = table.sinks.get_mut(channel) {
        sinks.retain(|(_, sink)| sink.send(envelope.payload.clone()).is_ok());
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
