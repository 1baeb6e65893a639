//! Taproot asset addresses: the destination side of a transfer request.

use serde::{Deserialize, Serialize};

use crate::asset::AssetId;
use crate::error::{Error, Result};
use crate::keys::SerializedKey;

/// A taproot asset address, describing one desired transfer output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapAddress {
    /// The asset to receive.
    pub asset_id: AssetId,
    /// The amount of asset units to receive.
    pub amount: u64,
    /// The script key the receiver will hold the asset under.
    pub script_key: SerializedKey,
    /// Address of the proof courier the receiver expects its proof from.
    /// Absent for interactive sends, where the receiver learns of the proof
    /// through another channel.
    pub proof_courier_addr: Option<String>,
}

impl TapAddress {
    /// Structurally validate the address.
    pub fn validate(&self) -> Result<()> {
        if self.amount == 0 {
            return Err(Error::InvalidAddress(format!(
                "zero amount for script key {}",
                self.script_key
            )));
        }
        Ok(())
    }
}
