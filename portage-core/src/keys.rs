//! Script keys in their serialized, compressed form.
//!
//! The transfer engine never performs elliptic-curve operations itself; keys
//! only need to be compared, hashed and handed to collaborators. They are
//! therefore carried as opaque 33-byte compressed public keys.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{Error, Result};

/// A compressed public key in its 33-byte serialized form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SerializedKey(#[serde(with = "BigArray")] pub [u8; 33]);

impl SerializedKey {
    /// Length of a serialized compressed key.
    pub const LEN: usize = 33;

    /// Create a key from its raw bytes.
    pub fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    /// Create a key from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(Error::InvalidKey(format!(
                "expected {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut arr = [0u8; 33];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl std::fmt::Display for SerializedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for SerializedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerializedKey({})", hex::encode(self.0))
    }
}

/// The canonical "nothing up my sleeve" key (the BIP-341 point H).
///
/// Outputs carrying this key are provably unspendable tombstones, produced
/// as the by-product of non-interactive splits.
pub const NUMS_KEY: SerializedKey = SerializedKey([
    0x02, 0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9,
    0x7a, 0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce,
    0x80, 0x3a, 0xc0,
]);

/// A script key attached to an asset, together with the pre-tweak internal
/// key when it is known.
///
/// `raw_key` being `Some` means this daemon knows how the tweaked key was
/// derived, which is a necessary (but not sufficient) condition for the key
/// being local: locality is decided by the key ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptKey {
    /// The tweaked, final script key as it appears in commitments.
    pub pub_key: SerializedKey,
    /// The pre-tweak internal key, if known.
    pub raw_key: Option<SerializedKey>,
}

impl ScriptKey {
    /// Create a script key whose derivation is unknown.
    pub fn new(pub_key: SerializedKey) -> Self {
        Self {
            pub_key,
            raw_key: None,
        }
    }

    /// Attach the known pre-tweak internal key.
    pub fn with_raw_key(mut self, raw_key: SerializedKey) -> Self {
        self.raw_key = Some(raw_key);
        self
    }

    /// Whether this is the provably unspendable tombstone key.
    pub fn is_unspendable(&self) -> bool {
        self.pub_key == NUMS_KEY
    }
}
