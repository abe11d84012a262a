//! MicroView: a low-overhead metric collection plane for containerized
//! workloads on RDMA-capable hosts.
//!
//! Pods publish metrics by writing into a shared-memory page. The host
//! [`agent`] exposes each page as a remotely readable region; the remote
//! [`collector`] scrapes every page with periodic batched one-sided READs,
//! so the steady-state host cost of a scrape is zero syscalls and zero CPU.

pub mod agent;
pub mod collector;
pub mod config;
pub mod error;
pub mod pod;
pub mod wire;

pub(crate) mod constants;
pub(crate) mod spawner;
pub(crate) mod verbs;

#[cfg(test)]
mod e2e;

pub use agent::HostAgent;
pub use collector::Collector;
pub use config::{AgentConfig, CollectorConfig, ConfigLoader};
pub use error::{Error, Result};
