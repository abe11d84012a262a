use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_MRS_PER_POD};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),
}

/// What to do when unlinking a pod's shared-memory object fails at teardown.
///
/// The unlink is known to fail occasionally; the root cause is still being
/// investigated, so the reaction is left tunable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnlinkPolicy {
    /// Log the error and move on.
    #[default]
    Ignore,
    /// Log the error and retry the unlink once.
    RetryOnce,
}

/// Host-agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Port of the pod-registration TCP listener. 0 picks an ephemeral port;
    /// whichever port is bound is written to the `.port` sidecar.
    pub listen_port: u16,
    /// Collector address.
    pub peer_ip: String,
    /// Collector RDMA listening port.
    pub peer_port: u16,
    /// Size of each pod's metric page in bytes.
    pub block_size: usize,
    /// Number of READ sink regions the collector keeps per pod.
    pub mrs_per_pod: usize,
    /// Liveness watcher wake period in seconds.
    pub liveness_period_secs: u64,
    /// Address/route resolution timeout in milliseconds.
    pub resolve_timeout_ms: u64,
    /// Reaction to `shm_unlink` failures at teardown.
    pub unlink_policy: UnlinkPolicy,
    /// Directory the `.port` sidecar is written into.
    pub workdir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            peer_ip: "127.0.0.1".into(),
            peer_port: 7471,
            block_size: DEFAULT_BLOCK_SIZE,
            mrs_per_pod: DEFAULT_MRS_PER_POD,
            liveness_period_secs: 2,
            resolve_timeout_ms: 500,
            unlink_policy: UnlinkPolicy::default(),
            workdir: PathBuf::from("."),
        }
    }
}

impl AgentConfig {
    /// Parses the agent CLI surface: `<peer-ip> <peer-port> <block-size>
    /// <mrs-per-pod>`.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ConfigError> {
        let mut args = args.into_iter();
        let mut cfg = Self::default();
        cfg.peer_ip = next_arg(&mut args, "peer-ip")?;
        cfg.peer_port = parse_arg(&mut args, "peer-port")?;
        cfg.block_size = parse_arg(&mut args, "block-size")?;
        cfg.mrs_per_pod = parse_arg(&mut args, "mrs-per-pod")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_sizes(self.block_size, self.mrs_per_pod)
    }
}

/// Collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// RDMA listening port.
    pub listen_port: u16,
    /// Scrape period in whole seconds.
    pub sampling_interval_secs: u64,
    /// Size of each READ in bytes; must match the agent's block size.
    pub block_size: usize,
    /// Number of READs issued per connection per tick.
    pub mrs_per_pod: usize,
    /// Directory latency sample files are written into.
    pub output_dir: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_port: 7471,
            sampling_interval_secs: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            mrs_per_pod: DEFAULT_MRS_PER_POD,
            output_dir: PathBuf::from("."),
        }
    }
}

impl CollectorConfig {
    /// Parses the collector CLI surface: `<listen-port>
    /// <sampling-interval-seconds> <block-size> <mrs-per-pod>`.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ConfigError> {
        let mut args = args.into_iter();
        let mut cfg = Self::default();
        cfg.listen_port = parse_arg(&mut args, "listen-port")?;
        cfg.sampling_interval_secs = parse_arg(&mut args, "sampling-interval-seconds")?;
        cfg.block_size = parse_arg(&mut args, "block-size")?;
        cfg.mrs_per_pod = parse_arg(&mut args, "mrs-per-pod")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_interval_secs == 0 {
            return Err(ConfigError::InvalidArg(
                "sampling interval must be at least one second".into(),
            ));
        }
        validate_sizes(self.block_size, self.mrs_per_pod)
    }
}

fn validate_sizes(block_size: usize, mrs_per_pod: usize) -> Result<(), ConfigError> {
    if block_size == 0 {
        return Err(ConfigError::InvalidArg("block size must be non-zero".into()));
    }
    if mrs_per_pod == 0 {
        return Err(ConfigError::InvalidArg(
            "mrs-per-pod must be non-zero".into(),
        ));
    }
    Ok(())
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads an agent configuration from a TOML file.
    pub fn load_agent(path: &str) -> Result<AgentConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads a collector configuration from a TOML file.
    pub fn load_collector(path: &str) -> Result<CollectorConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn next_arg<I: Iterator<Item = String>>(args: &mut I, name: &str) -> Result<String, ConfigError> {
    args.next()
        .ok_or_else(|| ConfigError::InvalidArg(format!("missing <{name}>")))
}

fn parse_arg<I, T>(args: &mut I, name: &str) -> Result<T, ConfigError>
where
    I: Iterator<Item = String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    next_arg(args, name)?
        .parse()
        .map_err(|err| ConfigError::InvalidArg(format!("<{name}>: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_args_parse() {
        let cfg = AgentConfig::from_args(
            ["192.168.0.2", "7471", "4096", "4"].map(String::from),
        )
        .unwrap();
        assert_eq!(cfg.peer_ip, "192.168.0.2");
        assert_eq!(cfg.peer_port, 7471);
        assert_eq!(cfg.block_size, 4096);
        assert_eq!(cfg.mrs_per_pod, 4);
    }

    #[test]
    fn collector_args_parse() {
        let cfg =
            CollectorConfig::from_args(["7471", "1", "1024", "2"].map(String::from)).unwrap();
        assert_eq!(cfg.listen_port, 7471);
        assert_eq!(cfg.sampling_interval_secs, 1);
        assert_eq!(cfg.mrs_per_pod, 2);
    }

    #[test]
    fn missing_arg_is_rejected() {
        assert!(CollectorConfig::from_args(["7471"].map(String::from)).is_err());
    }

    #[test]
    fn collector_toml_roundtrip() {
        let cfg = CollectorConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: CollectorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.listen_port, cfg.listen_port);
        assert_eq!(back.block_size, cfg.block_size);
    }
}
