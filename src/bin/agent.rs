use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use log::error;
use microview::{AgentConfig, HostAgent};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn main() {
    env_logger::init();

    let cfg = match AgentConfig::from_args(std::env::args().skip(1)) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("usage: microview-agent <peer-ip> <peer-port> <block-size> <mrs-per-pod>");
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let agent = match HostAgent::start(cfg) {
        Ok(agent) => agent,
        Err(err) => {
            error!("agent failed to start: {err}");
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
    agent.shutdown();
}
