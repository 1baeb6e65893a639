//! Portage Proof - Proof chains for Bitcoin-anchored assets.
//!
//! Every asset carries an ordered chain of state-transition proofs from its
//! genesis to its current resting place; a verifier replays the chain to
//! convince itself of the asset's entire history. This crate provides:
//!
//! - [`transition`] - A single transition proof ("suffix") and its
//!   enrichment with on-chain confirmation data
//! - [`file`] - The proof file: an append-only chain of transition proofs
//!   with a deterministic encoding
//! - [`archive`] - Locators, annotated proofs and the proof archive traits
//! - [`courier`] - Courier addresses and the out-of-band delivery traits
//! - [`watcher`] - The reorg watcher interface
//! - [`updater`] - Splicing a new suffix onto predecessor proof files
//!
//! The proof *construction* primitives (inclusion proofs, taproot script
//! derivation) live with the collaborators that produce suffixes; this crate
//! only assembles, stores and moves them.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod archive;
pub mod courier;
pub mod error;
pub mod file;
pub mod transition;
pub mod updater;
pub mod watcher;

pub use archive::{
    AnnotatedProof, ChainLookup, DefaultMerkleVerifier, GroupVerifier, HeaderVerifier, Locator,
    MerkleVerifier, ProofExporter, ProofImporter,
};
pub use courier::{
    Courier, CourierAddr, CourierDispatch, CourierError, CourierEvent, CourierEventKind,
    CourierProtocol, Recipient,
};
pub use error::{ProofError, Result};
pub use file::ProofFile;
pub use transition::{AnchorConfirmation, TransitionProof, TxConfirmation};
pub use updater::ProofUpdater;
pub use watcher::{ProofUpdateCallback, ReorgWatcher};
