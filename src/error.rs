//! Fatal-error taxonomy surfaced to [`crate::supervisor::Supervisor`].
//!
//! Per spec §7: only `ConfigError` and a doubly-failed `TokenError`
//! propagate this far. Everything else (network, channel, client, probe
//! errors) is handled or counted at a lower layer.

use crate::config::ConfigError;
use crate::token::TokenError;

/// An error that causes the process to exit. Maps to spec §6 exit codes:
/// `ConfigError` -> 1 (startup failure), `Auth` -> 2 (fatal runtime failure).
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("authentication failed after retry: {0}")]
    Auth(#[from] TokenError),
    #[error("channel open failed: {0}")]
    ChannelOpen(String),
}

impl FatalError {
    /// Process exit code per spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 1,
            FatalError::ChannelOpen(_) => 1,
            FatalError::Auth(_) => 2,
        }
    }
}
