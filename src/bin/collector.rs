use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use log::error;
use microview::{Collector, CollectorConfig};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn main() {
    env_logger::init();

    let cfg = match CollectorConfig::from_args(std::env::args().skip(1)) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!(
                "usage: microview-collector <listen-port> <sampling-interval-seconds> \
                 <block-size> <mrs-per-pod>"
            );
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let collector = match Collector::start(cfg) {
        Ok(collector) => collector,
        Err(err) => {
            error!("collector failed to start: {err}");
            std::process::exit(1);
        }
    };

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_sigint as libc::sighandler_t);
    }
    while !STOP.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    // Flushes every sample file through the exiting pollers.
    collector.shutdown();
}
