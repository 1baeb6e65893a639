//! Portage Porter - The transfer engine for Bitcoin-anchored assets.
//!
//! The porter takes transfer requests ("parcels"), drives each one through
//! a deterministic multi-stage pipeline, and produces an on-chain anchor
//! transaction plus the state-transition proofs every receiver needs:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           CHAIN PORTER                              │
//! │                                                                     │
//! │  RequestShipment ──▶ ingress queue ──▶ dispatcher ──▶ runner/parcel │
//! │                                                                     │
//! │  runner pipeline (strictly forward, checkpoint at *):               │
//! │                                                                     │
//! │   VirtualCommitmentSelect ─▶ VirtualSign ─▶ AnchorSign              │
//! │          ─▶ StorePreBroadcast* ─▶ Broadcast ─▶ WaitTxConf           │
//! │          ─▶ StoreProofs ─▶ TransferProofs ─▶ Complete               │
//! │                                                                     │
//! │  collaborators: asset wallet, BTC wallet, key ring, chain bridge,   │
//! │  export log, proof archive, courier dispatch, reorg watcher         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failures before the checkpoint release the wallet's locked inputs;
//! failures after it leave the parcel in the export log, from where the
//! next [`ChainPorter::start`] resumes it. No proof is handed to a courier
//! before the anchor transaction is confirmed and the sealed proof file is
//! in the local archive.
//!
//! # Example
//!
//! ```ignore
//! use portage_porter::{AddressParcel, ChainPorter, Parcel, PorterConfig};
//!
//! let porter = ChainPorter::new(config);
//! porter.start().await?;
//!
//! let parcel = Parcel::Address(AddressParcel::new(vec![address], None));
//! let outbound = porter.request_shipment(parcel).await?;
//! println!("anchor broadcast: {}", outbound.anchor_txid());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod events;
pub mod log;
pub mod package;
pub mod parcel;
pub mod porter;
pub mod state;
pub mod wallet;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{PorterError, Result};
pub use events::{AssetSendEvent, EventSubscription, PorterEvent};
pub use log::{
    AssetConfirmEvent, ExportLog, OutboundParcel, TransferInput, TransferOutput,
};
pub use package::SendPackage;
pub use parcel::{
    AddressParcel, Parcel, ParcelKit, ParcelResponses, PendingParcel, PreSignedParcel,
};
pub use porter::{
    default_wallet_lease_identifier, ChainPorter, PorterConfig, PorterTunables,
};
pub use state::SendState;
pub use wallet::{
    taproot_output_key, AnchorTransaction, AnchorVTxnsParams, AssetWallet, ChainBridge,
    ConfSubscription, FundSendResult, KeyRing, WalletAnchor,
};

// The confirmation type travels with the proofs it enriches.
pub use portage_proof::TxConfirmation;
