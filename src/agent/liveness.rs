//! Pod liveness watcher.
//!
//! Pods do not deregister; they just die. The watcher probes each
//! registered pod id with a null signal and disconnects the RDMA
//! connection of anything the kernel no longer knows. Teardown then drains
//! asynchronously through the usual disconnect path on both sides.

use std::{sync::Arc, time::Duration};

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

use crate::spawner::ShutdownSignal;

use super::PodTable;

/// Returns whether `pid` still names a live process. EPERM means the
/// process exists but belongs to someone else, which counts as alive.
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Runs the watcher loop until shutdown.
pub(crate) fn watch(pods: &Arc<PodTable>, period: Duration, shutdown: &Arc<ShutdownSignal>) {
    loop {
        if shutdown.wait_for(period) {
            return;
        }
        pods.reap_dead(process_alive);
    }
}
