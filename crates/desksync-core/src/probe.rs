//! Process-liveness boundary.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::BoxFuture;

/// Liveness query answered by the host platform layer.
///
/// A claimed repository owner is never trusted before this boundary confirms
/// the owning process still exists.
pub trait ProcessProbe: Send + Sync {
    /// Whether the process with `pid` is currently alive.
    fn is_alive(&self, pid: u32) -> BoxFuture<'_, bool>;
}

/// Probe answering from a fixed set, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    live: Arc<Mutex<HashSet<u32>>>,
    all_alive: bool,
}

impl StaticProbe {
    /// A probe that reports every pid alive.
    #[must_use]
    pub fn alive_all() -> Self {
        Self {
            live: Arc::default(),
            all_alive: true,
        }
    }

    /// A probe that reports only the given pids alive.
    #[must_use]
    pub fn with_live(pids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            live: Arc::new(Mutex::new(pids.into_iter().collect())),
            all_alive: false,
        }
    }

    /// Marks a pid dead after construction.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn mark_dead(&self, pid: u32) {
        self.live.lock().unwrap().remove(&pid);
    }
}

impl ProcessProbe for StaticProbe {
    fn is_alive(&self, pid: u32) -> BoxFuture<'_, bool> {
        let alive = self.all_alive || self.live.lock().unwrap().contains(&pid);
        Box::pin(async move { alive })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_probe_answers_from_its_set() {
        let probe = StaticProbe::with_live([10, 20]);
        assert!(probe.is_alive(10).await);
        assert!(!probe.is_alive(30).await);

        probe.mark_dead(10);
        assert!(!probe.is_alive(10).await);

        assert!(StaticProbe::alive_all().is_alive(99).await);
    }
}
