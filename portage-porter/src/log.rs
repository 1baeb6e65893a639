//! The export log: the durable record of outbound transfers.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portage_core::{AssetId, PrevId, ScriptKey, SerializedKey, VPacket, Witness};
use portage_proof::AnnotatedProof;

use crate::error::{PorterError, Result};
use crate::wallet::AnchorTransaction;

/// One consumed input of a persisted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInput {
    /// The previous resting place of the consumed asset.
    pub prev_id: PrevId,
    /// Amount of asset units consumed.
    pub amount: u64,
}

/// One produced output of a persisted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutput {
    /// The script key of the new asset state.
    pub script_key: ScriptKey,
    /// Whether the key ring can derive the raw key behind `script_key`.
    pub script_key_local: bool,
    /// Amount of asset units in the output.
    pub amount: u64,
    /// The anchor transaction output the new state commits to.
    pub anchor_outpoint: OutPoint,
    /// Satoshi value of that anchor output.
    pub anchor_value: u64,
    /// The encoded, still pending transition proof for this output.
    pub proof_suffix: Vec<u8>,
    /// Courier address to deliver the sealed proof to, if any.
    pub proof_courier_addr: Option<String>,
    /// Witnesses of the state transition.
    pub witness_data: Vec<Witness>,
}

/// The durable projection of an in-flight transfer, written to the export
/// log before broadcast and re-loaded on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundParcel {
    /// The signed anchor transaction.
    pub anchor_tx: Transaction,
    /// Height hint for confirmation rescans.
    pub anchor_tx_height_hint: u32,
    /// Consumed inputs.
    pub inputs: Vec<TransferInput>,
    /// Produced outputs.
    pub outputs: Vec<TransferOutput>,
    /// Passive packets re-anchored alongside the transfer.
    pub passive_assets: Vec<VPacket>,
}

impl OutboundParcel {
    /// The txid of the anchor transaction.
    pub fn anchor_txid(&self) -> Txid {
        self.anchor_tx.compute_txid()
    }

    /// Project the in-flight send state into its persistable form.
    ///
    /// `is_local` is the only way output locality is determined; it must be
    /// deterministic. A key without a known raw key is never local.
    pub fn from_send_components(
        height_hint: u32,
        active_packets: &[VPacket],
        anchor_tx: &AnchorTransaction,
        passive_packets: &[VPacket],
        is_local: &dyn Fn(&SerializedKey) -> bool,
    ) -> Result<Self> {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let anchor_txid = anchor_tx.tx.compute_txid();

        for packet in active_packets {
            for input in &packet.inputs {
                inputs.push(TransferInput {
                    prev_id: input.prev_id,
                    amount: input.asset.amount,
                });
            }

            for (idx, out) in packet.outputs.iter().enumerate() {
                let proof_suffix = out.proof_suffix.clone().ok_or_else(|| {
                    PorterError::Internal(format!("output {idx} is missing its proof suffix"))
                })?;
                let anchor_out = anchor_tx
                    .tx
                    .output
                    .get(out.anchor_output_index as usize)
                    .ok_or_else(|| {
                        PorterError::Internal(format!(
                            "output {idx} anchors to missing tx output {}",
                            out.anchor_output_index
                        ))
                    })?;

                let script_key_local = match out.script_key.raw_key {
                    Some(raw_key) => is_local(&raw_key),
                    None => false,
                };

                outputs.push(TransferOutput {
                    script_key: out.script_key,
                    script_key_local,
                    amount: out.amount,
                    anchor_outpoint: OutPoint {
                        txid: anchor_txid,
                        vout: out.anchor_output_index,
                    },
                    anchor_value: anchor_out.value.to_sat(),
                    proof_suffix,
                    proof_courier_addr: out.proof_courier_addr.clone(),
                    witness_data: out.asset.witnesses.clone(),
                });
            }
        }

        Ok(Self {
            anchor_tx: anchor_tx.tx.clone(),
            anchor_tx_height_hint: height_hint,
            inputs,
            outputs,
            passive_assets: passive_packets.to_vec(),
        })
    }
}

/// The confirmation record closing out a parcel in the export log.
#[derive(Debug, Clone)]
pub struct AssetConfirmEvent {
    /// Txid of the confirmed anchor transaction.
    pub anchor_txid: Txid,
    /// Hash of the confirming block.
    pub block_hash: BlockHash,
    /// Height of the confirming block.
    pub block_height: u32,
    /// Index of the anchor transaction within the block.
    pub tx_index: u32,
    /// Sealed proof file per active output script key.
    pub final_proofs: HashMap<SerializedKey, AnnotatedProof>,
    /// Sealed proof files of the passive assets, keyed by asset.
    pub passive_asset_proof_files: HashMap<AssetId, Vec<AnnotatedProof>>,
}

/// The durable log of outbound parcels.
///
/// `log_pending_parcel` and `confirm_parcel_delivery` are assumed atomic per
/// parcel, and confirmation must be idempotent so a resumed transfer can
/// re-confirm.
#[async_trait]
pub trait ExportLog: Send + Sync {
    /// Persist a pending parcel together with its wallet lease.
    async fn log_pending_parcel(
        &self,
        parcel: &OutboundParcel,
        lease_identifier: [u8; 32],
        lease_deadline: DateTime<Utc>,
    ) -> Result<()>;

    /// All parcels that were persisted but never confirmed.
    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>>;

    /// Query parcels, optionally filtered by anchor txid and pending state.
    async fn query_parcels(
        &self,
        anchor_tx_hash: Option<Txid>,
        pending_only: bool,
    ) -> Result<Vec<OutboundParcel>>;

    /// Mark a parcel as confirmed and delivered.
    async fn confirm_parcel_delivery(&self, event: &AssetConfirmEvent) -> Result<()>;
}
