//! Splicing a freshly confirmed transition onto predecessor proof files.

use portage_core::{PrevId, SerializedKey};

use crate::archive::{AnnotatedProof, Locator, ProofExporter};
use crate::error::{ProofError, Result};
use crate::file::ProofFile;
use crate::transition::{TransitionProof, TxConfirmation};

/// Builds updated proof files by appending a confirmed suffix to the proof
/// file(s) of the inputs it consumed.
pub struct ProofUpdater<'a> {
    archive: &'a dyn ProofExporter,
}

impl<'a> ProofUpdater<'a> {
    /// Create an updater reading predecessor files from the given archive.
    pub fn new(archive: &'a dyn ProofExporter) -> Self {
        Self { archive }
    }

    /// Produce the sealed proof file for one transfer output.
    ///
    /// The first input's proof file becomes the trunk the suffix is appended
    /// to; the proof files of any further inputs (a merge of multiple
    /// lineages) are attached to the suffix so a verifier can reconstruct
    /// every lineage. Callers must order `inputs` deterministically - the
    /// source order within the virtual packet - so reruns produce
    /// byte-identical files.
    pub async fn update_proof_file(
        &self,
        inputs: &[PrevId],
        suffix: &mut TransitionProof,
        new_script_key: SerializedKey,
        conf: &TxConfirmation,
    ) -> Result<AnnotatedProof> {
        let Some(first_input) = inputs.first() else {
            return Err(ProofError::MissingInputProof(
                "no inputs for proof update".into(),
            ));
        };

        // The suffix doesn't know about the confirmed block yet.
        suffix.update_transition_proof(conf)?;

        let mut trunk = self.fetch_input_proof(first_input).await?;

        // Any further inputs mean this output merges multiple lineages.
        for input in &inputs[1..] {
            let additional = self.fetch_input_proof(input).await?;
            suffix.additional_inputs.push(additional);
        }

        trunk.append(suffix.clone())?;
        let blob = trunk.encode()?;

        let locator = Locator {
            asset_id: first_input.asset_id,
            script_key: new_script_key,
            out_point: Some(suffix.out_point()),
        };

        Ok(AnnotatedProof { locator, blob })
    }

    /// Fetch and decode the proof file of a single transfer input.
    async fn fetch_input_proof(&self, input: &PrevId) -> Result<ProofFile> {
        let locator = Locator {
            asset_id: input.asset_id,
            script_key: input.script_key,
            out_point: Some(input.out_point),
        };
        let blob = self
            .archive
            .fetch_proof(&locator)
            .await
            .map_err(|e| ProofError::MissingInputProof(format!("locator {locator}: {e}")))?;

        ProofFile::decode(&blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileVersion;
    use crate::transition::AnchorConfirmation;
    use async_trait::async_trait;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::Header;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{BlockHash, CompactTarget, OutPoint, Transaction, TxMerkleNode, Txid};
    use parking_lot::Mutex;
    use portage_core::AssetId;
    use std::collections::HashMap;

    struct MemoryArchive {
        proofs: Mutex<HashMap<Locator, Vec<u8>>>,
    }

    impl MemoryArchive {
        fn new() -> Self {
            Self {
                proofs: Mutex::new(HashMap::new()),
            }
        }

        fn insert(&self, locator: Locator, blob: Vec<u8>) {
            self.proofs.lock().insert(locator, blob);
        }
    }

    #[async_trait]
    impl ProofExporter for MemoryArchive {
        async fn fetch_proof(&self, locator: &Locator) -> Result<Vec<u8>> {
            self.proofs
                .lock()
                .get(locator)
                .cloned()
                .ok_or_else(|| ProofError::Archive(format!("no proof for {locator}")))
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

    fn anchor_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    fn genesis_file(asset_id: AssetId, key: SerializedKey, tag: u8) -> ProofFile {
        let mut genesis = TransitionProof::new(
            asset_id,
            100,
            key,
            OutPoint {
                txid: Txid::from_byte_array([tag; 32]),
                vout: 0,
            },
            vec![],
        );
        genesis.anchor = Some(AnchorConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 1,
            header: dummy_header(),
            tx_index: 0,
        });

        let mut file = ProofFile::new(FileVersion::V0);
        file.append(genesis).unwrap();
        file
    }

    fn seeded_input(archive: &MemoryArchive, asset_id: AssetId, tag: u8) -> PrevId {
        let key = SerializedKey::new([tag; 33]);
        let prev_id = PrevId {
            out_point: OutPoint {
                txid: Txid::from_byte_array([tag; 32]),
                vout: 0,
            },
            asset_id,
            script_key: key,
        };
        let file = genesis_file(asset_id, key, tag);
        archive.insert(
            Locator {
                asset_id,
                script_key: key,
                out_point: Some(prev_id.out_point),
            },
            file.encode().unwrap(),
        );
        prev_id
    }

    #[tokio::test]
    async fn test_single_input_update() {
        let archive = MemoryArchive::new();
        let asset_id = AssetId::new([1; 32]);
        let input = seeded_input(&archive, asset_id, 10);

        let tx = anchor_tx();
        let new_key = SerializedKey::new([9; 33]);
        let mut suffix = TransitionProof::new(
            asset_id,
            100,
            new_key,
            OutPoint {
                txid: tx.compute_txid(),
                vout: 0,
            },
            vec![],
        );
        let conf = TxConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 500,
            header: dummy_header(),
            tx,
            tx_index: 2,
        };

        let updater = ProofUpdater::new(&archive);
        let annotated = updater
            .update_proof_file(&[input], &mut suffix, new_key, &conf)
            .await
            .unwrap();

        assert_eq!(annotated.locator.script_key, new_key);
        assert_eq!(annotated.locator.out_point, Some(suffix.out_point()));

        let file = ProofFile::decode(&annotated.blob).unwrap();
        assert_eq!(file.num_proofs(), 2);
        let last = file.last_proof().unwrap();
        assert_eq!(last.anchor.as_ref().unwrap().block_height, 500);
        assert!(last.additional_inputs.is_empty());
    }

    #[tokio::test]
    async fn test_merge_attaches_additional_lineages() {
        let archive = MemoryArchive::new();
        let asset_id = AssetId::new([1; 32]);
        let first = seeded_input(&archive, asset_id, 10);
        let second = seeded_input(&archive, asset_id, 20);

        let tx = anchor_tx();
        let new_key = SerializedKey::new([9; 33]);
        let mut suffix = TransitionProof::new(
            asset_id,
            200,
            new_key,
            OutPoint {
                txid: tx.compute_txid(),
                vout: 0,
            },
            vec![],
        );
        let conf = TxConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 500,
            header: dummy_header(),
            tx,
            tx_index: 2,
        };

        let updater = ProofUpdater::new(&archive);
        let annotated = updater
            .update_proof_file(&[first, second], &mut suffix, new_key, &conf)
            .await
            .unwrap();

        // The trunk is the first input's lineage, the second is carried in
        // the suffix.
        let file = ProofFile::decode(&annotated.blob).unwrap();
        assert_eq!(file.num_proofs(), 2);
        let last = file.last_proof().unwrap();
        assert_eq!(last.additional_inputs.len(), 1);
        assert_eq!(
            last.additional_inputs[0].last_proof().unwrap().script_key,
            second.script_key
        );
    }

    #[tokio::test]
    async fn test_missing_input_proof() {
        let archive = MemoryArchive::new();
        let asset_id = AssetId::new([1; 32]);
        let input = PrevId {
            out_point: OutPoint {
                txid: Txid::from_byte_array([7; 32]),
                vout: 0,
            },
            asset_id,
            script_key: SerializedKey::new([7; 33]),
        };

        let tx = anchor_tx();
        let new_key = SerializedKey::new([9; 33]);
        let mut suffix = TransitionProof::new(
            asset_id,
            100,
            new_key,
            OutPoint {
                txid: tx.compute_txid(),
                vout: 0,
            },
            vec![],
        );
        let conf = TxConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 500,
            header: dummy_header(),
            tx,
            tx_index: 2,
        };

        let updater = ProofUpdater::new(&archive);
        let err = updater
            .update_proof_file(&[input], &mut suffix, new_key, &conf)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofError::MissingInputProof(_)));

        let err = updater
            .update_proof_file(&[], &mut suffix, new_key, &conf)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofError::MissingInputProof(_)));
    }
}
