//! Error types for proof handling.

use thiserror::Error;

/// Result type for proof operations.
pub type Result<T> = std::result::Result<T, ProofError>;

/// Errors that can occur while assembling, storing or shipping proofs.
#[derive(Debug, Clone, Error)]
pub enum ProofError {
    /// The proof file of a transfer input could not be found in the archive.
    #[error("missing input proof: {0}")]
    MissingInputProof(String),

    /// A proof or proof file could not be decoded.
    #[error("failed to decode proof: {0}")]
    DecodeFailed(String),

    /// A proof or proof file could not be encoded.
    #[error("failed to encode proof: {0}")]
    EncodeFailed(String),

    /// A suffix could not be appended to a proof file.
    #[error("failed to append proof: {0}")]
    AppendFailed(String),

    /// A proof file failed verification.
    #[error("proof verification failed: {0}")]
    VerificationFailed(String),

    /// A proof courier address could not be parsed.
    #[error("invalid proof courier address: {0}")]
    InvalidCourierAddr(String),

    /// The proof archive rejected an operation.
    #[error("proof archive error: {0}")]
    Archive(String),

    /// The reorg watcher rejected an operation.
    #[error("proof watcher error: {0}")]
    Watcher(String),
}
