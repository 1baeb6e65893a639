//! Portage Core - Fundamental types for Bitcoin-anchored assets.
//!
//! This crate provides the data model shared by the rest of the Portage
//! system:
//!
//! - [`keys`] - Serialized script keys, the tombstone (NUMS) key and burn
//!   key derivation
//! - [`asset`] - Asset IDs, previous-input IDs, witnesses and asset records
//! - [`commitment`] - The set of assets committed to a single anchor output
//! - [`address`] - Taproot asset addresses (destination of a transfer)
//! - [`packet`] - Virtual packets: asset-level transactions that are later
//!   anchored into a Bitcoin transaction
//!
//! # Example
//!
//! ```rust
//! use portage_core::{Asset, AssetId, ScriptKey, SerializedKey};
//!
//! let asset_id = AssetId::new([7u8; 32]);
//! let script_key = ScriptKey::new(SerializedKey::new([2u8; 33]));
//!
//! let asset = Asset::new(asset_id, 5_000, script_key);
//! assert_eq!(asset.amount, 5_000);
//! assert!(!asset.script_key.is_unspendable());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod address;
pub mod asset;
pub mod commitment;
pub mod error;
pub mod keys;
pub mod packet;

pub use address::TapAddress;
pub use asset::{is_burn_key, Asset, AssetId, PrevId, Witness};
pub use commitment::Commitment;
pub use error::{Error, Result};
pub use keys::{ScriptKey, SerializedKey, NUMS_KEY};
pub use packet::{validate_packet_versions, PacketVersion, VInput, VOutput, VPacket};
