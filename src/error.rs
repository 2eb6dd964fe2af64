//! Error taxonomy surfaced to callers of the voice core.
//!
//! Internal I/O paths use `anyhow` and degrade locally (dropped frame,
//! placeholder profile). Only the variants below cross into the
//! user-visible layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// No credential for the selected upstream provider. Fatal at open time.
    #[error("missing credential for {provider}: set one of {env_vars}")]
    MissingCredential {
        provider: &'static str,
        env_vars: String,
    },

    /// A required configuration value (endpoint, agent identifier) is absent.
    #[error("missing configuration value: {0}")]
    MissingConfig(String),

    /// The duplex channel could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A frame could not be delivered or decoded.
    #[error("transport error: {0}")]
    Transport(String),

    /// The analysis collaborator failed.
    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("unknown topic: {0}")]
    InvalidTopic(String),
}

impl VoiceError {
    /// Configuration errors are never retried automatically.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential { .. } | Self::MissingConfig(_)
        )
    }
}
