//! Error types for the rigsync environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A queue between two session tasks was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl EnvError {
    /// Creates a channel-closed error.
    pub fn closed(what: impl Into<String>) -> Self {
        Self::ChannelClosed(what.into())
    }
}
