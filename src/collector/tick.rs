//! Scrape tick scheduler.
//!
//! One tick thread fans a one-shot signal out to every connection slot.
//! The flag deliberately has no depth: a poller that missed ticks sees a
//! single pending one and posts a single batch, trading backlog for
//! freshness under overload.

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::spawner::ShutdownSignal;

use super::{latency::RoundClock, ConnRegistry};

/// Outcome of waiting on a slot's scrape signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickWait {
    /// A tick was consumed; post the next batch.
    Tick,
    /// The slot was aborted; exit the poller.
    Abort,
}

#[derive(Debug, Default)]
struct SlotState {
    ticked: bool,
    aborted: bool,
}

/// One connection's scrape mailbox: single producer (tick thread), single
/// consumer (that connection's poller).
#[derive(Debug, Default)]
pub(crate) struct ScrapeSignal {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl ScrapeSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets the one-shot flag. Setting it twice before the consumer runs
    /// still yields a single tick.
    pub(crate) fn signal(&self) {
        let mut state = self.state.lock();
        state.ticked = true;
        self.cv.notify_one();
    }

    /// Permanently wakes the slot for teardown.
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cv.notify_all();
    }

    /// Blocks until a tick (consumed atomically) or abort.
    pub(crate) fn wait(&self) -> TickWait {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return TickWait::Abort;
            }
            if state.ticked {
                state.ticked = false;
                return TickWait::Tick;
            }
            self.cv.wait(&mut state);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_signaled(&self) -> bool {
        self.state.lock().ticked
    }
}

/// Runs the tick loop until shutdown: open a fresh round, then signal
/// every slot.
pub(crate) fn run(
    registry: &Arc<ConnRegistry>,
    round: &Arc<RoundClock>,
    interval: Duration,
    shutdown: &Arc<ShutdownSignal>,
) {
    loop {
        if shutdown.wait_for(interval) {
            return;
        }
        let slots = registry.slots();
        round.begin(slots.len());
        for slot in slots {
            slot.signal();
        }
    }
}
