//! Channel error types.

use buildit_config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("private key error: {0}")]
    PrivateKey(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ChannelError {
    /// Startup errors caused by missing or unusable certificate material.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ChannelError::TlsConfig(_)
                | ChannelError::Certificate(_)
                | ChannelError::PrivateKey(_)
                | ChannelError::Read { .. }
                | ChannelError::Config(_)
        )
    }
}
