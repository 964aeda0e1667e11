//! Unix process liveness probe.

// Pids fit in i32 on every platform nix supports.
#![allow(clippy::cast_possible_wrap)]

use desksync_core::{BoxFuture, ProcessProbe};
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Probes liveness with `kill(pid, 0)`: signal delivery is checked but no
/// signal is sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessProbe;

impl ProcessProbe for UnixProcessProbe {
    fn is_alive(&self, pid: u32) -> BoxFuture<'_, bool> {
        let alive = pid != 0 && kill(Pid::from_raw(pid as i32), None).is_ok();
        Box::pin(async move { alive })
    }
}
