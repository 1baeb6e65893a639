//! Asset records and the IDs that tie them to prior on-chain state.

use bitcoin::hashes::Hash as _;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::{ScriptKey, SerializedKey};

/// Tag used when deriving burn keys.
const BURN_KEY_TAG: &[u8] = b"portage/burnkey";

/// The 32-byte identifier of an asset genesis.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub [u8; 32]);

impl AssetId {
    /// Create an asset ID from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw ID bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetId({})", hex::encode(self.0))
    }
}

/// Identifies the previous resting place of an asset: the anchor outpoint it
/// was committed to, its asset ID and the script key it was held by before
/// the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrevId {
    /// The Bitcoin outpoint the asset commitment was anchored to.
    pub out_point: OutPoint,
    /// The asset being spent.
    pub asset_id: AssetId,
    /// The script key the asset was locked to before the transfer.
    pub script_key: SerializedKey,
}

impl PrevId {
    /// Derive the burn key for this previous input.
    ///
    /// An output whose script key equals the burn key of its first witness'
    /// prev ID is a burn: provably unspendable and never delivered to any
    /// receiver.
    pub fn burn_key(&self) -> SerializedKey {
        let mut hasher = Sha256::new();
        hasher.update(BURN_KEY_TAG);
        hasher.update(self.out_point.txid.to_byte_array());
        hasher.update(self.out_point.vout.to_be_bytes());
        hasher.update(self.asset_id.as_bytes());
        hasher.update(self.script_key.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        let mut key = [0u8; 33];
        key[0] = 0x02;
        key[1..].copy_from_slice(&digest);
        SerializedKey::new(key)
    }
}

impl std::fmt::Display for PrevId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.asset_id, self.script_key, self.out_point)
    }
}

/// The witness of a single asset-level state transition input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    /// The previous input this witness spends, if any.
    pub prev_id: Option<PrevId>,
    /// The raw witness stack proving authorization of the spend.
    pub tx_witness: Vec<Vec<u8>>,
}

/// Check whether a script key is the burn key of the given witness.
pub fn is_burn_key(script_key: &SerializedKey, witness: &Witness) -> bool {
    match &witness.prev_id {
        Some(prev_id) => *script_key == prev_id.burn_key(),
        None => false,
    }
}

/// A single asset as it rests in (or will rest in) a commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Genesis ID of the asset.
    pub asset_id: AssetId,
    /// Amount of asset units held.
    pub amount: u64,
    /// Key the asset is locked to.
    pub script_key: ScriptKey,
    /// Witnesses of the state transition that created this asset state.
    /// Empty until the transition has been signed.
    pub witnesses: Vec<Witness>,
}

impl Asset {
    /// Create a new, unsigned asset record.
    pub fn new(asset_id: AssetId, amount: u64, script_key: ScriptKey) -> Self {
        Self {
            asset_id,
            amount,
            script_key,
            witnesses: Vec::new(),
        }
    }

    /// Whether this asset is a burn output.
    pub fn is_burn(&self) -> bool {
        self.witnesses
            .first()
            .is_some_and(|w| is_burn_key(&self.script_key.pub_key, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn prev_id(tag: u8) -> PrevId {
        PrevId {
            out_point: OutPoint {
                txid: Txid::from_byte_array([tag; 32]),
                vout: 0,
            },
            asset_id: AssetId::new([tag; 32]),
            script_key: SerializedKey::new([tag; 33]),
        }
    }

    #[test]
    fn test_burn_key_is_deterministic() {
        let prev = prev_id(1);
        assert_eq!(prev.burn_key(), prev.burn_key());
        assert_ne!(prev.burn_key(), prev_id(2).burn_key());
    }

    #[test]
    fn test_is_burn_key() {
        let prev = prev_id(3);
        let witness = Witness {
            prev_id: Some(prev),
            tx_witness: vec![vec![0u8; 64]],
        };

        assert!(is_burn_key(&prev.burn_key(), &witness));
        assert!(!is_burn_key(&SerializedKey::new([9u8; 33]), &witness));

        // A witness without a prev ID can never mark a burn.
        let genesis_witness = Witness {
            prev_id: None,
            tx_witness: vec![],
        };
        assert!(!is_burn_key(&prev.burn_key(), &genesis_witness));
    }

    #[test]
    fn test_asset_is_burn() {
        let prev = prev_id(4);
        let mut asset = Asset::new(
            prev.asset_id,
            100,
            ScriptKey::new(prev.burn_key()),
        );
        assert!(!asset.is_burn());

        asset.witnesses.push(Witness {
            prev_id: Some(prev),
            tx_witness: vec![],
        });
        assert!(asset.is_burn());
    }
}
