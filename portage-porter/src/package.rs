//! The in-flight state of a single transfer.

use std::collections::{HashMap, HashSet};

use bitcoin::OutPoint;

use portage_core::{Asset, Commitment, PrevId, SerializedKey, VPacket};
use portage_proof::{AnnotatedProof, TxConfirmation};

use crate::error::{PorterError, Result};
use crate::log::OutboundParcel;
use crate::parcel::{Parcel, ParcelKit};
use crate::state::SendState;
use crate::wallet::AnchorTransaction;

/// The sole mutable object threaded through the pipeline.
///
/// A package is created on parcel ingress, owned exclusively by the runner
/// task driving its state machine, and discarded once it reaches a terminal
/// state; only its [`OutboundParcel`] projection outlives it.
#[derive(Debug)]
pub struct SendPackage {
    /// The originating parcel.
    pub parcel: Parcel,
    /// The current pipeline state.
    pub send_state: SendState,
    /// The active asset-level transactions of the transfer.
    pub virtual_packets: Vec<VPacket>,
    /// The full commitment of every consumed input.
    pub input_commitments: HashMap<PrevId, Commitment>,
    /// Packets re-anchoring assets that co-reside in a consumed commitment
    /// but are not themselves transferred.
    pub passive_assets: Vec<VPacket>,
    /// The funded, signed anchor transaction and the wallet UTXOs it locked.
    pub anchor_tx: Option<AnchorTransaction>,
    /// The persisted projection, written before broadcast.
    pub outbound: Option<OutboundParcel>,
    /// The confirmation of the anchor transaction.
    pub conf_event: Option<TxConfirmation>,
    /// Sealed proof file per active output script key.
    pub final_proofs: HashMap<SerializedKey, AnnotatedProof>,
}

impl SendPackage {
    /// Create a fresh package at the given starting state.
    pub(crate) fn new(parcel: Parcel, send_state: SendState) -> Self {
        Self {
            parcel,
            send_state,
            virtual_packets: Vec::new(),
            input_commitments: HashMap::new(),
            passive_assets: Vec::new(),
            anchor_tx: None,
            outbound: None,
            conf_event: None,
            final_proofs: HashMap::new(),
        }
    }

    /// Access the response kit of the originating parcel.
    pub(crate) fn kit_mut(&mut self) -> &mut ParcelKit {
        self.parcel.kit_mut()
    }

    /// A clonable view of the package for events and background delivery.
    pub(crate) fn snapshot(&self) -> PackageSnapshot {
        PackageSnapshot {
            virtual_packets: self.virtual_packets.clone(),
            passive_assets: self.passive_assets.clone(),
            anchor_tx: self.anchor_tx.clone(),
            outbound: self.outbound.clone(),
            conf_event: self.conf_event.clone(),
            final_proofs: self.final_proofs.clone(),
        }
    }

    /// Check that the transfer is balanced before it is persisted and
    /// broadcast.
    ///
    /// Every asset committed to a consumed input must either be consumed by
    /// an active or passive packet (and thereby re-created under the new
    /// anchor) or appear in `pruned_assets` (burns and tombstones that are
    /// dropped on purpose). The anchor transaction must spend every
    /// committed outpoint, and every active output must carry a witness.
    ///
    /// Failure here is fatal: inputs are unlocked and the parcel rejected.
    pub fn validate_ready_for_publish(
        &self,
        pruned_assets: &HashMap<OutPoint, Vec<Asset>>,
    ) -> Result<()> {
        let anchor = self.anchor_tx.as_ref().ok_or_else(|| {
            PorterError::UnbalancedTransfer("no anchor transaction built".into())
        })?;

        for packet in &self.virtual_packets {
            if !packet.is_fully_signed() {
                return Err(PorterError::UnbalancedTransfer(
                    "active packet output without witness".into(),
                ));
            }
        }

        let spent: HashSet<OutPoint> =
            anchor.tx.input.iter().map(|i| i.previous_output).collect();
        for prev_id in self.input_commitments.keys() {
            if !spent.contains(&prev_id.out_point) {
                return Err(PorterError::UnbalancedTransfer(format!(
                    "anchor tx does not spend committed outpoint {}",
                    prev_id.out_point
                )));
            }
        }

        for (prev_id, commitment) in &self.input_commitments {
            for asset in &commitment.assets {
                if self.consumed_by_packet(commitment, asset) {
                    continue;
                }

                let pruned = pruned_assets
                    .get(&prev_id.out_point)
                    .is_some_and(|assets| {
                        assets.iter().any(|a| {
                            a.asset_id == asset.asset_id
                                && a.script_key.pub_key == asset.script_key.pub_key
                        })
                    });
                if pruned {
                    continue;
                }

                return Err(PorterError::UnbalancedTransfer(format!(
                    "asset {} held by {} in input commitment {} is not carried \
                     into the new anchor",
                    asset.asset_id, asset.script_key.pub_key, prev_id.out_point
                )));
            }
        }

        Ok(())
    }

    /// Whether any active or passive packet consumes the given committed
    /// asset.
    fn consumed_by_packet(&self, commitment: &Commitment, asset: &Asset) -> bool {
        self.virtual_packets
            .iter()
            .chain(self.passive_assets.iter())
            .flat_map(|p| p.inputs.iter())
            .any(|input| {
                input.prev_id.out_point == commitment.anchor_point
                    && input.prev_id.asset_id == asset.asset_id
                    && input.prev_id.script_key == asset.script_key.pub_key
            })
    }
}

/// The clonable portion of a [`SendPackage`].
#[derive(Debug, Clone)]
pub(crate) struct PackageSnapshot {
    pub(crate) virtual_packets: Vec<VPacket>,
    pub(crate) passive_assets: Vec<VPacket>,
    pub(crate) anchor_tx: Option<AnchorTransaction>,
    pub(crate) outbound: Option<OutboundParcel>,
    pub(crate) conf_event: Option<TxConfirmation>,
    pub(crate) final_proofs: HashMap<SerializedKey, AnnotatedProof>,
}
