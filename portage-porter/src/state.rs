//! The send states a transfer moves through.

use serde::{Deserialize, Serialize};

/// The linear pipeline of a single transfer.
///
/// States only ever increase within one run; `Complete` and `Failed` are
/// terminal. Everything from `Broadcast` onward must be idempotent against a
/// restart, because `StorePreBroadcast` is the durable checkpoint a crashed
/// transfer resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SendState {
    /// Asset-level coin selection through the asset wallet.
    VirtualCommitmentSelect,
    /// Signing every input of every virtual packet.
    VirtualSign,
    /// Creating and signing passive packets, then building the signed
    /// Bitcoin anchor transaction.
    AnchorSign,
    /// Persisting the outbound parcel to the export log. This is the
    /// durable checkpoint.
    StorePreBroadcast,
    /// Importing local anchor outputs and publishing the anchor transaction.
    Broadcast,
    /// Waiting for on-chain confirmation of the anchor transaction.
    WaitTxConf,
    /// Assembling and archiving the updated proof files.
    StoreProofs,
    /// Delivering receiver proofs out of band and confirming the parcel.
    TransferProofs,
    /// The transfer finished; proof delivery may still be running in the
    /// background.
    Complete,
    /// The transfer can never complete (e.g. its anchor transaction was a
    /// double spend) and its inputs have been released.
    Failed,
}

impl std::fmt::Display for SendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SendState::VirtualCommitmentSelect => "virtual_commitment_select",
            SendState::VirtualSign => "virtual_sign",
            SendState::AnchorSign => "anchor_sign",
            SendState::StorePreBroadcast => "store_pre_broadcast",
            SendState::Broadcast => "broadcast",
            SendState::WaitTxConf => "wait_tx_conf",
            SendState::StoreProofs => "store_proofs",
            SendState::TransferProofs => "transfer_proofs",
            SendState::Complete => "complete",
            SendState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}
