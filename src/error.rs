//! Error types for the CCB broker

use std::io;

use thiserror::Error;

use crate::ccbid::TargetId;

/// Errors while framing or parsing a message record
#[derive(Debug, Error)]
pub enum MessageError {
    /// Socket read/write failed (includes timeouts and peer hangups)
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Frame header announced a payload larger than the limit
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    /// Payload was not a key/value record
    #[error("invalid message: {0}")]
    Invalid(String),
}

/// Errors touching the reconnect log on disk
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reconnect log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no reconnect log configured")]
    NoPath,
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Reasons a target may not reclaim a previous TargetID
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("ccbid {0} has no reconnect info")]
    UnknownTarget(TargetId),
    #[error("ccbid {id} reconnecting from {actual}, expected IP {expected}")]
    WrongIp {
        id: TargetId,
        expected: String,
        actual: String,
    },
    #[error("ccbid {0} presented the wrong reconnect cookie")]
    WrongCookie(TargetId),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the target/requester helpers
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid ccb contact string '{0}'")]
    BadContact(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Fatal broker errors (startup or reactor failure)
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("random number generator failure")]
    Random,
}
