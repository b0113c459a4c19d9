use crate::ethereum::ChainError;
use crate::utils::types::StoreError;
use thiserror::Error;

/// Errors surfaced by the plugin. Failures inside queue reducers are reported
/// through the handle returned by the queue and leave the cached channel
/// state untouched.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid claim: {0}")]
    InvalidClaim(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid ilp packet: {0}")]
    InvalidPacket(String),

    #[error("ethereum address of the peer is not linked")]
    NoLinkedAddress,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("queued task was dropped before completion")]
    Cancelled,
}
