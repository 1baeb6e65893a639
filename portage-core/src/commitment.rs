//! Asset commitments: the full set of assets anchored to one Bitcoin output.

use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

use crate::asset::Asset;

/// The set of assets committed to a single anchor output.
///
/// Spending the anchor output consumes every asset in the commitment, so a
/// transfer of one of them must re-anchor the others (as passive assets) or
/// account for them as pruned burns and tombstones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// The Bitcoin outpoint this commitment is anchored to.
    pub anchor_point: OutPoint,
    /// All assets resting in the commitment.
    pub assets: Vec<Asset>,
}

impl Commitment {
    /// Create a new commitment at the given anchor outpoint.
    pub fn new(anchor_point: OutPoint, assets: Vec<Asset>) -> Self {
        Self {
            anchor_point,
            assets,
        }
    }

    /// Assets in this commitment that are provably unspendable: tombstones
    /// left behind by splits, and burns.
    ///
    /// These are pruned from the new commitment instead of being carried as
    /// passive assets.
    pub fn unspendable_assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets
            .iter()
            .filter(|a| a.script_key.is_unspendable() || a.is_burn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetId;
    use crate::keys::{ScriptKey, SerializedKey, NUMS_KEY};
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    #[test]
    fn test_unspendable_assets() {
        let anchor = OutPoint {
            txid: Txid::from_byte_array([1; 32]),
            vout: 0,
        };
        let live = Asset::new(
            AssetId::new([2; 32]),
            100,
            ScriptKey::new(SerializedKey::new([2; 33])),
        );
        let tombstone = Asset::new(AssetId::new([2; 32]), 0, ScriptKey::new(NUMS_KEY));

        let commitment = Commitment::new(anchor, vec![live.clone(), tombstone.clone()]);
        let pruned: Vec<_> = commitment.unspendable_assets().collect();
        assert_eq!(pruned, vec![&tombstone]);
    }
}
