//! Proof files: the append-only proof chain of a single asset.

use serde::{Deserialize, Serialize};

use crate::archive::{GroupVerifier, HeaderVerifier, MerkleVerifier};
use crate::error::{ProofError, Result};
use crate::transition::TransitionProof;

/// Version of the proof file encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileVersion {
    /// Initial version.
    V0,
}

/// An ordered chain of transition proofs from an asset's genesis to its
/// current resting place.
///
/// Files only grow: each transfer appends exactly one suffix. Encoding is
/// deterministic, so decoding and re-encoding a file yields identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofFile {
    /// Encoding version.
    pub version: FileVersion,
    /// The proof chain, genesis first.
    pub proofs: Vec<TransitionProof>,
}

impl ProofFile {
    /// Create an empty proof file.
    pub fn new(version: FileVersion) -> Self {
        Self {
            version,
            proofs: Vec::new(),
        }
    }

    /// Number of transitions in the file.
    pub fn num_proofs(&self) -> usize {
        self.proofs.len()
    }

    /// Whether the file contains no proofs.
    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }

    /// The most recent transition, if any.
    pub fn last_proof(&self) -> Option<&TransitionProof> {
        self.proofs.last()
    }

    /// Append a suffix to the chain.
    ///
    /// The suffix must already carry its confirmation data; a pending proof
    /// can never become part of a sealed file.
    pub fn append(&mut self, suffix: TransitionProof) -> Result<()> {
        if !suffix.is_anchored() {
            return Err(ProofError::AppendFailed(format!(
                "suffix for outpoint {} has no confirmation data",
                suffix.anchor_outpoint
            )));
        }
        if let Some(last) = self.last_proof() {
            if last.asset_id != suffix.asset_id {
                return Err(ProofError::AppendFailed(format!(
                    "suffix asset {} does not continue chain of asset {}",
                    suffix.asset_id, last.asset_id
                )));
            }
        }

        self.proofs.push(suffix);
        Ok(())
    }

    /// Encode the file to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProofError::EncodeFailed(e.to_string()))
    }

    /// Decode a file from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProofError::DecodeFailed(e.to_string()))
    }

    /// Verify the structural soundness of the whole chain and run every
    /// transition past the injected verifiers.
    pub fn verify(
        &self,
        header_verifier: &dyn HeaderVerifier,
        merkle_verifier: &dyn MerkleVerifier,
        group_verifier: &dyn GroupVerifier,
    ) -> Result<()> {
        if self.is_empty() {
            return Err(ProofError::VerificationFailed("empty proof file".into()));
        }

        for (idx, proof) in self.proofs.iter().enumerate() {
            let anchor = proof.anchor.as_ref().ok_or_else(|| {
                ProofError::VerificationFailed(format!("proof {idx} is not anchored"))
            })?;

            header_verifier.verify_header(&anchor.header, anchor.block_height)?;
            merkle_verifier.verify_tx_inclusion(proof)?;
            group_verifier.verify_group_key(&proof.asset_id)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DefaultMerkleVerifier;
    use crate::transition::{AnchorConfirmation, TransitionProof};
    use bitcoin::block::Header;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, CompactTarget, OutPoint, TxMerkleNode, Txid};
    use portage_core::{AssetId, SerializedKey};

    struct AcceptAll;

    impl HeaderVerifier for AcceptAll {
        fn verify_header(&self, _header: &Header, _height: u32) -> Result<()> {
            Ok(())
        }
    }

    impl GroupVerifier for AcceptAll {
        fn verify_group_key(&self, _asset_id: &AssetId) -> Result<()> {
            Ok(())
        }
    }

    fn anchored_proof(asset_tag: u8, height: u32) -> TransitionProof {
        let mut proof = TransitionProof::new(
            AssetId::new([asset_tag; 32]),
            100,
            SerializedKey::new([asset_tag; 33]),
            OutPoint {
                txid: Txid::from_byte_array([height as u8; 32]),
                vout: 0,
            },
            vec![],
        );
        proof.anchor = Some(AnchorConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: height,
            header: Header {
                version: bitcoin::block::Version::TWO,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0),
                nonce: 0,
            },
            tx_index: 1,
        });
        proof
    }

    #[test]
    fn test_append_requires_anchor() {
        let mut file = ProofFile::new(FileVersion::V0);
        let mut pending = anchored_proof(1, 10);
        pending.anchor = None;
        assert!(file.append(pending).is_err());

        file.append(anchored_proof(1, 10)).unwrap();
        assert_eq!(file.num_proofs(), 1);
    }

    #[test]
    fn test_append_rejects_foreign_asset() {
        let mut file = ProofFile::new(FileVersion::V0);
        file.append(anchored_proof(1, 10)).unwrap();
        assert!(file.append(anchored_proof(2, 11)).is_err());
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        let mut file = ProofFile::new(FileVersion::V0);
        file.append(anchored_proof(1, 10)).unwrap();
        file.append(anchored_proof(1, 20)).unwrap();

        let bytes = file.encode().unwrap();
        let decoded = ProofFile::decode(&bytes).unwrap();
        assert_eq!(decoded, file);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn test_verify() {
        let mut file = ProofFile::new(FileVersion::V0);
        assert!(file
            .verify(&AcceptAll, &DefaultMerkleVerifier, &AcceptAll)
            .is_err());

        file.append(anchored_proof(1, 10)).unwrap();
        file.verify(&AcceptAll, &DefaultMerkleVerifier, &AcceptAll)
            .unwrap();
    }
}
