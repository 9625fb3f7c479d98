//! Error taxonomy for the pool engine

use std::io;
use thiserror::Error;

/// Pool engine error type
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("configuration error: {0}")]
    ConfigFatal(String),

    #[error("remote handshake failed: {0}")]
    RemoteHandshakeFailed(String),

    #[error("remote I/O failed: {0}")]
    RemoteIoFailed(String),

    #[error("client protocol error: {0}")]
    ClientProtocolError(String),

    #[error("no ready port available")]
    NoReady,

    #[error("shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    pub fn config_fatal<S: Into<String>>(msg: S) -> Self {
        PoolError::ConfigFatal(msg.into())
    }

    pub fn remote_handshake_failed<S: Into<String>>(msg: S) -> Self {
        PoolError::RemoteHandshakeFailed(msg.into())
    }

    pub fn remote_io_failed<S: Into<String>>(msg: S) -> Self {
        PoolError::RemoteIoFailed(msg.into())
    }

    pub fn client_protocol<S: Into<String>>(msg: S) -> Self {
        PoolError::ClientProtocolError(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PoolError::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        PoolError::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for PoolError {
    fn from(e: serde_yaml::Error) -> Self {
        PoolError::ConfigFatal(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PoolError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        PoolError::Timeout(e.to_string())
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, PoolError>;
