//! Error types for the core data model.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or validating core types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A serialized key had the wrong length or format.
    #[error("invalid script key: {0}")]
    InvalidKey(String),

    /// An asset record is malformed.
    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    /// A taproot asset address is malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A virtual packet is structurally invalid.
    #[error("invalid virtual packet: {0}")]
    InvalidPacket(String),

    /// Virtual packets in a transfer disagree on their version.
    #[error("incompatible packet versions: {0}")]
    IncompatibleVersions(String),
}
