use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::info;
use parking_lot::{Condvar, Mutex};

/// Spawns a named worker thread that logs its lifetime.
pub(crate) fn spawn_worker<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let name = name.to_owned();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            info!("worker {name} running");
            f();
            info!("worker {name} exited");
        })
        .unwrap_or_else(|err| unreachable!("failed to spawn worker: {err}"))
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AbortSignal {
    inner: Arc<AtomicBool>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn should_abort(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    pub(crate) fn abort(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }
}

/// Interruptible sleep used by the periodic workers (tick thread, liveness
/// watcher). `wait_for` returns `true` once shutdown has been requested so
/// the loop can exit without draining the full period.
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn shutdown(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.stopped.lock()
    }

    pub(crate) fn wait_for(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        let _timed_out = self.cv.wait_for(&mut stopped, period);
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn wait_for_returns_early_on_shutdown() {
        let signal = ShutdownSignal::new();
        let signal_c = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signal_c.shutdown();
        });
        let start = Instant::now();
        assert!(signal.wait_for(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_times_out_when_running() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_for(Duration::from_millis(10)));
    }
}
