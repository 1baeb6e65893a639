//! A single state-transition proof and its on-chain anchor data.

use bitcoin::block::Header;
use bitcoin::{BlockHash, OutPoint, Transaction};
use serde::{Deserialize, Serialize};

use portage_core::{AssetId, SerializedKey, Witness};

use crate::error::{ProofError, Result};
use crate::file::ProofFile;

/// A confirmed anchor transaction as observed on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfirmation {
    /// Hash of the block containing the anchor transaction.
    pub block_hash: BlockHash,
    /// Height of that block.
    pub block_height: u32,
    /// Header of that block.
    pub header: Header,
    /// The confirmed anchor transaction.
    pub tx: Transaction,
    /// Index of the transaction within the block.
    pub tx_index: u32,
}

/// The on-chain confirmation data embedded in a transition proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorConfirmation {
    /// Hash of the confirming block.
    pub block_hash: BlockHash,
    /// Height of the confirming block.
    pub block_height: u32,
    /// Header of the confirming block.
    pub header: Header,
    /// Index of the anchor transaction within the block.
    pub tx_index: u32,
}

/// A single state-transition record: the "suffix" appended to an asset's
/// proof file by one transfer.
///
/// A suffix is created in a pending state when the anchor transaction is
/// built and becomes a verifiable proof once
/// [`update_transition_proof`](Self::update_transition_proof) has embedded
/// the confirmation data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionProof {
    /// The asset this transition moves.
    pub asset_id: AssetId,
    /// Amount of asset units in the new output.
    pub amount: u64,
    /// The post-transfer script key of the new output.
    pub script_key: SerializedKey,
    /// The anchor transaction output the new asset state is committed to.
    pub anchor_outpoint: OutPoint,
    /// Witnesses of the state transition.
    pub witnesses: Vec<Witness>,
    /// Full proof files of any additional inputs merged into this output.
    /// The first input's file is the trunk the suffix is appended to; every
    /// further lineage is carried here so a verifier can reconstruct it.
    pub additional_inputs: Vec<ProofFile>,
    /// On-chain confirmation of the anchor transaction. `None` while the
    /// proof is pending.
    pub anchor: Option<AnchorConfirmation>,
}

impl TransitionProof {
    /// Create a new, pending transition proof.
    pub fn new(
        asset_id: AssetId,
        amount: u64,
        script_key: SerializedKey,
        anchor_outpoint: OutPoint,
        witnesses: Vec<Witness>,
    ) -> Self {
        Self {
            asset_id,
            amount,
            script_key,
            anchor_outpoint,
            witnesses,
            additional_inputs: Vec::new(),
            anchor: None,
        }
    }

    /// Embed the confirmation data, turning the pending suffix into a
    /// verifiable on-chain-anchored proof.
    pub fn update_transition_proof(&mut self, conf: &TxConfirmation) -> Result<()> {
        let conf_txid = conf.tx.compute_txid();
        if conf_txid != self.anchor_outpoint.txid {
            return Err(ProofError::VerificationFailed(format!(
                "confirmation for tx {conf_txid} does not match anchor outpoint {}",
                self.anchor_outpoint
            )));
        }

        self.anchor = Some(AnchorConfirmation {
            block_hash: conf.block_hash,
            block_height: conf.block_height,
            header: conf.header,
            tx_index: conf.tx_index,
        });
        Ok(())
    }

    /// The anchor outpoint the new asset state rests on.
    pub fn out_point(&self) -> OutPoint {
        self.anchor_outpoint
    }

    /// Whether the proof carries confirmation data.
    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Prev IDs referenced by the transition's witnesses, in witness order.
    pub fn witness_prev_ids(&self) -> Vec<portage_core::PrevId> {
        self.witnesses.iter().filter_map(|w| w.prev_id).collect()
    }

    /// Encode the proof to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProofError::EncodeFailed(e.to_string()))
    }

    /// Decode a proof from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProofError::DecodeFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{CompactTarget, TxMerkleNode};

    fn dummy_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    fn dummy_header() -> Header {
        Header {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0),
            nonce: 0,
        }
    }

    fn pending_proof(anchor_txid: bitcoin::Txid) -> TransitionProof {
        TransitionProof::new(
            AssetId::new([1; 32]),
            500,
            SerializedKey::new([2; 33]),
            OutPoint {
                txid: anchor_txid,
                vout: 0,
            },
            vec![],
        )
    }

    #[test]
    fn test_update_transition_proof() {
        let tx = dummy_tx();
        let mut proof = pending_proof(tx.compute_txid());
        assert!(!proof.is_anchored());

        let conf = TxConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 1_000,
            header: dummy_header(),
            tx: tx.clone(),
            tx_index: 3,
        };
        proof.update_transition_proof(&conf).unwrap();

        assert!(proof.is_anchored());
        let anchor = proof.anchor.as_ref().unwrap();
        assert_eq!(anchor.block_height, 1_000);
        assert_eq!(anchor.tx_index, 3);
    }

    #[test]
    fn test_update_rejects_wrong_tx() {
        let mut proof = pending_proof(bitcoin::Txid::from_byte_array([9; 32]));
        let conf = TxConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 1,
            header: dummy_header(),
            tx: dummy_tx(),
            tx_index: 0,
        };
        assert!(proof.update_transition_proof(&conf).is_err());
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut proof = pending_proof(bitcoin::Txid::from_byte_array([5; 32]));
        proof.witnesses.push(portage_core::Witness {
            prev_id: None,
            tx_witness: vec![vec![1, 2, 3]],
        });

        let bytes = proof.encode().unwrap();
        let decoded = TransitionProof::decode(&bytes).unwrap();
        assert_eq!(proof, decoded);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }
}
