//! Error types shared by the DHT engine and its transports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a connection handshake is refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum HandshakeError {
    /// A logical connection between the two peers already exists.
    #[error("duplicate connection")]
    DuplicateConnection,
    /// The peer reached is not the peer the dialer expected.
    #[error("invalid presumed peer descriptor")]
    InvalidPresumedPeerDescriptor,
    /// The peer speaks a different protocol version.
    #[error("unsupported protocol version")]
    UnsupportedVersion,
}

/// Errors produced by the DHT and connection layers.
///
/// Per-peer failures (`Unreachable`, `Timeout`, `Remote`) are expected to be
/// caught by the caller and turned into "skip this peer". `Configuration` is
/// fatal at construction time and `Stopped` aborts whatever was in flight.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("handshake rejected: {0}")]
    Handshake(HandshakeError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node stopped")]
    Stopped,
}

impl DhtError {
    /// True for errors that should only exclude one peer from the current round.
    pub fn is_peer_failure(&self) -> bool {
        !matches!(self, DhtError::Stopped | DhtError::Configuration(_))
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, DhtError>;
