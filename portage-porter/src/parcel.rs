//! Transfer requests ("parcels") and their response kits.

use std::collections::HashMap;

use bitcoin::FeeRate;
use tokio::sync::oneshot;

use portage_core::{Commitment, PrevId, TapAddress, VPacket};

use crate::error::{PorterError, Result};
use crate::log::OutboundParcel;
use crate::package::SendPackage;
use crate::state::SendState;

/// The response channel pair bundled with each parcel.
///
/// Exactly one of the two channels is eventually signalled: the success
/// channel once the anchor transaction has been broadcast, or the error
/// channel when the transfer fails. Both stay silent if the parcel is
/// abandoned on shutdown.
#[derive(Debug, Default)]
pub struct ParcelKit {
    pub(crate) resp: Option<oneshot::Sender<OutboundParcel>>,
    pub(crate) err: Option<oneshot::Sender<PorterError>>,
}

impl ParcelKit {
    /// Create a connected kit and the receiving half for the caller.
    pub fn new() -> (Self, ParcelResponses) {
        let (resp_tx, resp_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        (
            Self {
                resp: Some(resp_tx),
                err: Some(err_tx),
            },
            ParcelResponses {
                resp: resp_rx,
                err: err_rx,
            },
        )
    }

    /// A kit with no listener, used for resumed parcels.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Signal the broadcast of the transfer.
    pub(crate) fn deliver_response(&mut self, parcel: OutboundParcel) {
        if let Some(tx) = self.resp.take() {
            let _ = tx.send(parcel);
        }
    }

    /// Signal a terminal error.
    pub(crate) fn deliver_err(&mut self, err: PorterError) {
        if let Some(tx) = self.err.take() {
            let _ = tx.send(err);
        }
    }
}

/// The receiving half of a [`ParcelKit`].
#[derive(Debug)]
pub struct ParcelResponses {
    /// Resolves with the outbound parcel once it has been broadcast.
    pub resp: oneshot::Receiver<OutboundParcel>,
    /// Resolves with the terminal error of the transfer, if any.
    pub err: oneshot::Receiver<PorterError>,
}

/// A transfer request to one or more taproot asset addresses.
#[derive(Debug)]
pub struct AddressParcel {
    pub(crate) kit: ParcelKit,
    /// Destination addresses, all for the same asset.
    pub dest_addrs: Vec<TapAddress>,
    /// Manual fee rate override; estimated when absent.
    pub transfer_fee_rate: Option<FeeRate>,
}

impl AddressParcel {
    /// Create an address parcel.
    pub fn new(dest_addrs: Vec<TapAddress>, transfer_fee_rate: Option<FeeRate>) -> Self {
        Self {
            kit: ParcelKit::detached(),
            dest_addrs,
            transfer_fee_rate,
        }
    }
}

/// A transfer request carrying pre-built, pre-signed virtual packets,
/// bypassing coin selection and virtual signing.
#[derive(Debug)]
pub struct PreSignedParcel {
    pub(crate) kit: ParcelKit,
    /// The signed virtual packets of the transfer.
    pub packets: Vec<VPacket>,
    /// The commitments of every consumed input.
    pub input_commitments: HashMap<PrevId, Commitment>,
}

impl PreSignedParcel {
    /// Create a pre-signed parcel.
    pub fn new(packets: Vec<VPacket>, input_commitments: HashMap<PrevId, Commitment>) -> Self {
        Self {
            kit: ParcelKit::detached(),
            packets,
            input_commitments,
        }
    }
}

/// A previously persisted transfer being resumed after a restart.
#[derive(Debug)]
pub struct PendingParcel {
    pub(crate) kit: ParcelKit,
    /// The stored outbound parcel.
    pub outbound: OutboundParcel,
}

impl PendingParcel {
    /// Create a pending parcel from its stored projection.
    pub fn new(outbound: OutboundParcel) -> Self {
        Self {
            kit: ParcelKit::detached(),
            outbound,
        }
    }
}

/// The recognised transfer request variants.
#[derive(Debug)]
pub enum Parcel {
    /// Send to taproot asset addresses.
    Address(AddressParcel),
    /// Send pre-built, pre-signed virtual packets.
    PreSigned(PreSignedParcel),
    /// Resume a persisted transfer.
    Pending(PendingParcel),
}

impl Parcel {
    /// Structurally validate the parcel.
    pub fn validate(&self) -> Result<()> {
        match self {
            Parcel::Address(parcel) => {
                let Some(first) = parcel.dest_addrs.first() else {
                    return Err(PorterError::InvalidParcel(
                        "at least one destination address required".into(),
                    ));
                };
                for addr in &parcel.dest_addrs {
                    addr.validate()
                        .map_err(|e| PorterError::InvalidParcel(e.to_string()))?;
                    if addr.asset_id != first.asset_id {
                        return Err(PorterError::InvalidParcel(format!(
                            "mixed asset IDs: {} and {}",
                            first.asset_id, addr.asset_id
                        )));
                    }
                }
                Ok(())
            }

            Parcel::PreSigned(parcel) => {
                if parcel.packets.is_empty() {
                    return Err(PorterError::InvalidParcel(
                        "pre-signed parcel without packets".into(),
                    ));
                }
                for packet in &parcel.packets {
                    if packet.inputs.is_empty() || packet.outputs.is_empty() {
                        return Err(PorterError::InvalidParcel(
                            "pre-signed packet without inputs or outputs".into(),
                        ));
                    }
                    for input in &packet.inputs {
                        if !parcel.input_commitments.contains_key(&input.prev_id) {
                            return Err(PorterError::InvalidParcel(format!(
                                "missing input commitment for {}",
                                input.prev_id
                            )));
                        }
                    }
                }
                Ok(())
            }

            Parcel::Pending(parcel) => {
                if parcel.outbound.anchor_tx.output.is_empty() {
                    return Err(PorterError::InvalidParcel(
                        "pending parcel with empty anchor transaction".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Attach a response kit, replacing the current one.
    pub(crate) fn set_kit(&mut self, kit: ParcelKit) {
        *self.kit_slot() = kit;
    }

    /// Access the response kit.
    pub(crate) fn kit_mut(&mut self) -> &mut ParcelKit {
        self.kit_slot()
    }

    fn kit_slot(&mut self) -> &mut ParcelKit {
        match self {
            Parcel::Address(p) => &mut p.kit,
            Parcel::PreSigned(p) => &mut p.kit,
            Parcel::Pending(p) => &mut p.kit,
        }
    }

    /// Materialise the initial send package, selecting the starting state
    /// for the variant.
    pub(crate) fn pkg(self) -> SendPackage {
        let start_state = match &self {
            // Address sends run the full pipeline.
            Parcel::Address(_) => SendState::VirtualCommitmentSelect,
            // Pre-signed packets skip coin selection and virtual signing.
            Parcel::PreSigned(_) => SendState::AnchorSign,
            // Resumed parcels re-enter at broadcast: re-import and
            // re-publish of the stored transaction are idempotent.
            Parcel::Pending(_) => SendState::Broadcast,
        };

        let mut pkg = SendPackage::new(self, start_state);
        match &pkg.parcel {
            Parcel::Address(_) => {}
            Parcel::PreSigned(parcel) => {
                pkg.virtual_packets = parcel.packets.clone();
                pkg.input_commitments = parcel.input_commitments.clone();
            }
            Parcel::Pending(parcel) => {
                pkg.passive_assets = parcel.outbound.passive_assets.clone();
                pkg.outbound = Some(parcel.outbound.clone());
            }
        }
        pkg
    }
}
