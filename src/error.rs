//! Error types for the scraping plane.

use std::io;

use thiserror::Error;

/// Result type for scraping-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the agent or the collector.
///
/// The taxonomy follows the recovery boundaries of the system: transport
/// setup errors end the enclosing session, connection-scoped errors end a
/// single connection, handler errors end a single registration handler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport setup failed (bind, listen, accept)
    #[error("transport setup failed: {0}")]
    Transport(String),

    /// Address or route resolution failed
    #[error("resolution failed: {0}")]
    Resolve(String),

    /// Building connection resources (PD, CQ, QP, MR) failed
    #[error("connection build failed: {0}")]
    ConnectionBuild(String),

    /// A work completion came back with a non-success status
    #[error("work completion failed: {0}")]
    Completion(String),

    /// Unexpected control message for the current connection state
    #[error("control protocol violation: {0}")]
    Protocol(String),

    /// Shared memory operation failed
    #[error("shared memory error: {0}")]
    Shm(String),

    /// The peer disconnected or the event channel was torn down
    #[error("connection disconnected")]
    Disconnected,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
