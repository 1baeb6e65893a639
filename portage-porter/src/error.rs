//! Error types for the transfer engine.

use thiserror::Error;

use portage_proof::ProofError;

/// Result type for porter operations.
pub type Result<T> = std::result::Result<T, PorterError>;

/// Errors that can occur while driving a transfer through the pipeline.
///
/// Errors raised before the pre-broadcast checkpoint release the wallet's
/// locked inputs; errors raised after it leave the inputs leased so the
/// transfer can resume on the next start.
#[derive(Debug, Clone, Error)]
pub enum PorterError {
    /// A parcel failed structural validation at ingress.
    #[error("invalid parcel: {0}")]
    InvalidParcel(String),

    /// A state received a parcel variant it cannot process.
    #[error("wrong parcel variant: {0}")]
    WrongParcelVariant(String),

    /// Asset-level coin selection failed.
    #[error("coin selection failed: {0}")]
    CoinSelection(String),

    /// Signing a virtual or passive packet failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The chain bridge could not produce a fee estimate.
    #[error("fee estimation failed: {0}")]
    FeeEstimation(String),

    /// An asset committed to an input is not carried into the new anchor.
    #[error("send package not balanced: {0}")]
    UnbalancedTransfer(String),

    /// Writing or reading the export log failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// The anchor transaction double-spends one of its inputs and will
    /// never confirm.
    #[error("transaction rejected as double spend: {0}")]
    DoubleSpend(String),

    /// Broadcasting the anchor transaction failed for a recoverable reason.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The confirmation notifier failed.
    #[error("confirmation notifier failed: {0}")]
    Notifier(String),

    /// A Bitcoin wallet operation failed.
    #[error("wallet error: {0}")]
    Wallet(String),

    /// A proof could not be delivered to its receiver.
    #[error("courier error: {0}")]
    Courier(String),

    /// A proof could not be assembled, stored or fetched.
    #[error("proof error: {0}")]
    Proof(#[from] ProofError),

    /// A core data model invariant was violated.
    #[error("core error: {0}")]
    Core(#[from] portage_core::Error),

    /// The porter is shutting down.
    #[error("chain porter shutting down")]
    ShuttingDown,

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}
