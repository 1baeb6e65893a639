//! Virtual packets: asset-level transactions.
//!
//! A virtual packet describes the movement of one asset independently of the
//! Bitcoin transaction that will eventually anchor it. Inputs reference the
//! previous resting places of the asset, outputs describe the post-transfer
//! states. Witnesses are populated by the asset signer, proof suffixes by the
//! anchoring step.

use serde::{Deserialize, Serialize};

use crate::asset::{Asset, PrevId};
use crate::error::{Error, Result};
use crate::keys::ScriptKey;

/// Version of the virtual packet encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PacketVersion {
    /// Initial version.
    V0,
    /// Version with grouped-asset support.
    V1,
}

impl std::fmt::Display for PacketVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketVersion::V0 => write!(f, "v0"),
            PacketVersion::V1 => write!(f, "v1"),
        }
    }
}

/// An input of a virtual packet: the asset state being consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VInput {
    /// Identifies the previous resting place of the consumed asset.
    pub prev_id: PrevId,
    /// The pre-transfer asset record.
    pub asset: Asset,
}

/// An output of a virtual packet: one post-transfer asset state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VOutput {
    /// Amount of asset units in this output.
    pub amount: u64,
    /// The script key the output is locked to.
    pub script_key: ScriptKey,
    /// The post-transfer asset record. Its witnesses are filled in by the
    /// asset signer.
    pub asset: Asset,
    /// Index of the anchor transaction output this output commits to.
    pub anchor_output_index: u32,
    /// Encoded transition proof for this output, populated once the anchor
    /// transaction has been built.
    pub proof_suffix: Option<Vec<u8>>,
    /// Courier address to deliver this output's proof to, if any.
    pub proof_courier_addr: Option<String>,
}

/// A virtual packet: inputs, outputs and the packet version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VPacket {
    /// Encoding version of the packet.
    pub version: PacketVersion,
    /// Consumed asset states.
    pub inputs: Vec<VInput>,
    /// Produced asset states.
    pub outputs: Vec<VOutput>,
}

impl VPacket {
    /// Create a packet with the given inputs and outputs.
    pub fn new(version: PacketVersion, inputs: Vec<VInput>, outputs: Vec<VOutput>) -> Self {
        Self {
            version,
            inputs,
            outputs,
        }
    }

    /// The prev IDs consumed by this packet, in input order.
    pub fn input_prev_ids(&self) -> Vec<PrevId> {
        self.inputs.iter().map(|i| i.prev_id).collect()
    }

    /// Whether every output of the packet carries a signed witness.
    pub fn is_fully_signed(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|o| !o.asset.witnesses.is_empty())
    }
}

/// Ensure all packets of a transfer agree on one packet version.
pub fn validate_packet_versions(packets: &[VPacket]) -> Result<()> {
    let Some(first) = packets.first() else {
        return Err(Error::InvalidPacket("no virtual packets".into()));
    };
    for packet in &packets[1..] {
        if packet.version != first.version {
            return Err(Error::IncompatibleVersions(format!(
                "{} and {}",
                first.version, packet.version
            )));
        }
    }
    Ok(())
}
