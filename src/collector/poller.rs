//! Per-connection completion poller.
//!
//! Each connection pins one thread to its completion channel: wait, re-arm,
//! drain, dispatch. When a batch has fully returned the poller parks on the
//! connection's scrape signal until the tick thread releases it. Any error
//! ends the loop and flows into teardown; the thread writes its own sample
//! file on the way out, and the last poller standing also writes the global
//! round samples.

use std::{path::PathBuf, sync::Arc};

use log::{info, warn};

use crate::error::{Error, Result};

use super::{
    connection::ScrapeConnection,
    latency::RoundClock,
    tick::{ScrapeSignal, TickWait},
    ConnRegistry,
};

pub(crate) struct Poller {
    pub(crate) conn: ScrapeConnection,
    pub(crate) slot: Arc<ScrapeSignal>,
    pub(crate) round: Arc<RoundClock>,
    pub(crate) registry: Arc<ConnRegistry>,
    pub(crate) output_dir: PathBuf,
}

impl Poller {
    pub(crate) fn run(mut self) {
        let index = self.conn.index();
        match self.drive() {
            Ok(()) | Err(Error::Disconnected) => info!("connection {index}: poller done"),
            Err(err) => warn!("connection {index}: poller failed: {err}"),
        }

        self.registry.remove(index);
        let meter = self.conn.teardown();
        let path = self.output_dir.join(format!("latency_samples_{index}.txt"));
        if let Err(err) = meter.write_to(&path) {
            warn!("connection {index}: sample file: {err}");
        }
        if self.registry.poller_exited() == 0 {
            let path = self.output_dir.join("read_completion_latency.txt");
            if let Err(err) = self.round.write_to(&path) {
                warn!("global sample file: {err}");
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        loop {
            if self.conn.ready_to_arm() {
                match self.slot.wait() {
                    TickWait::Tick => self.conn.arm_batch()?,
                    TickWait::Abort => return Err(Error::Disconnected),
                }
            }
            self.conn.wait_completions()?;
            self.conn.rearm();
            while let Some(wc) = self.conn.poll_completion() {
                self.conn.on_completion(wc, &self.round)?;
            }
        }
    }
}
