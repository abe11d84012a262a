//! Latency accounting: per-connection batch meters and the global round
//! clock.

use std::{
    io::{self, Write},
    path::Path,
    time::{Duration, Instant},
};

use log::debug;
use parking_lot::Mutex;

/// Growable sample array; one meter per connection plus one global.
#[derive(Debug, Default)]
pub(crate) struct LatencyMeter {
    samples: Vec<u64>,
}

impl LatencyMeter {
    pub(crate) fn record(&mut self, elapsed: Duration) {
        self.samples.push(elapsed.as_nanos() as u64);
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Writes the samples, one decimal nanosecond count per line.
    pub(crate) fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        for sample in &self.samples {
            writeln!(out, "{sample}")?;
        }
        out.flush()
    }
}

/// State of the current scrape round, shared between the tick thread and
/// every poller.
#[derive(Debug)]
struct Round {
    /// Connections that have completed their batch this round.
    finished: usize,
    /// Connections the round was armed for.
    active: usize,
    start: Instant,
    meter: LatencyMeter,
}

/// Global round clock. A round's latency is recorded only once every
/// connection armed at tick time has finished its full batch.
#[derive(Debug)]
pub(crate) struct RoundClock {
    inner: Mutex<Round>,
}

impl RoundClock {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Round {
                finished: 0,
                active: 0,
                start: Instant::now(),
                meter: LatencyMeter::default(),
            }),
        }
    }

    /// Opens a new round over `active` connections.
    pub(crate) fn begin(&self, active: usize) {
        let mut round = self.inner.lock();
        round.finished = 0;
        round.active = active;
        round.start = Instant::now();
    }

    /// Reports one connection's completed batch; stamps the round when it
    /// is the last one.
    pub(crate) fn finish_connection(&self) {
        let mut round = self.inner.lock();
        round.finished += 1;
        if round.active > 0 && round.finished == round.active {
            let elapsed = round.start.elapsed();
            round.meter.record(elapsed);
            debug!(
                "round complete: {} connections in {} ns",
                round.active,
                elapsed.as_nanos()
            );
        }
    }

    pub(crate) fn sample_count(&self) -> usize {
        self.inner.lock().meter.len()
    }

    pub(crate) fn write_to(&self, path: &Path) -> io::Result<()> {
        self.inner.lock().meter.write_to(path)
    }
}
