//! The proof archive: locators, annotated proofs and the import/export
//! traits the transfer engine consumes.

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

use portage_core::{AssetId, SerializedKey};

use crate::error::{ProofError, Result};
use crate::transition::TransitionProof;

/// Identifies one proof file in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    /// The asset the proof file belongs to.
    pub asset_id: AssetId,
    /// The script key of the asset's current (or queried) resting place.
    pub script_key: SerializedKey,
    /// The anchor outpoint of that resting place, if known.
    pub out_point: Option<OutPoint>,
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.asset_id, self.script_key)?;
        if let Some(op) = &self.out_point {
            write!(f, "@{op}")?;
        }
        Ok(())
    }
}

/// A fully encoded proof file together with the locator it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedProof {
    /// Where the proof lives in the archive.
    pub locator: Locator,
    /// The encoded proof file.
    pub blob: Vec<u8>,
}

/// Verifies that a block header exists on the chain being followed.
pub trait HeaderVerifier: Send + Sync {
    /// Verify the given header at the given height.
    fn verify_header(&self, header: &Header, height: u32) -> Result<()>;
}

/// Verifies the inclusion of an anchor transaction in its block.
pub trait MerkleVerifier: Send + Sync {
    /// Verify the transaction inclusion claim of a transition proof.
    fn verify_tx_inclusion(&self, proof: &TransitionProof) -> Result<()>;
}

/// Verifies the group key of an asset genesis.
pub trait GroupVerifier: Send + Sync {
    /// Verify the group key for the given asset.
    fn verify_group_key(&self, asset_id: &AssetId) -> Result<()>;
}

/// Chain state lookups needed while verifying proofs.
#[async_trait]
pub trait ChainLookup: Send + Sync {
    /// The best known block height.
    async fn best_height(&self) -> Result<u32>;
}

/// Structural merkle verification.
///
/// The full inclusion-proof check lives with the proof producers; this
/// verifier enforces the invariants the transfer engine relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMerkleVerifier;

impl MerkleVerifier for DefaultMerkleVerifier {
    fn verify_tx_inclusion(&self, proof: &TransitionProof) -> Result<()> {
        match &proof.anchor {
            Some(_) => Ok(()),
            None => Err(ProofError::VerificationFailed(format!(
                "proof for outpoint {} has no anchor data",
                proof.anchor_outpoint
            ))),
        }
    }
}

/// Stores fully populated proofs in the local archive.
#[async_trait]
pub trait ProofImporter: Send + Sync {
    /// Import the given proofs.
    ///
    /// With `replace` set, an existing proof under the same locator is
    /// expected and overwritten; without it the proofs are treated as new.
    /// Imports must tolerate re-imports of identical proofs so that a
    /// resumed transfer can replay its proof storage.
    async fn import_proofs(
        &self,
        header_verifier: &dyn HeaderVerifier,
        merkle_verifier: &dyn MerkleVerifier,
        group_verifier: &dyn GroupVerifier,
        chain_lookup: &dyn ChainLookup,
        replace: bool,
        proofs: Vec<AnnotatedProof>,
    ) -> Result<()>;
}

/// Fetches encoded proof files from the local archive.
#[async_trait]
pub trait ProofExporter: Send + Sync {
    /// Fetch the proof file stored under the given locator.
    async fn fetch_proof(&self, locator: &Locator) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    #[test]
    fn test_locator_display() {
        let locator = Locator {
            asset_id: AssetId::new([1; 32]),
            script_key: SerializedKey::new([2; 33]),
            out_point: Some(OutPoint {
                txid: Txid::from_byte_array([3; 32]),
                vout: 7,
            }),
        };
        let rendered = locator.to_string();
        assert!(rendered.contains(':'));
        assert!(rendered.ends_with(":7"));
    }
}
