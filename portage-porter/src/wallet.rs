//! Collaborator interfaces on the wallet and chain side.
//!
//! The porter never constructs virtual transactions, holds keys or talks to
//! a Bitcoin node itself; all of that is delegated through the traits in
//! this module.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{FeeRate, OutPoint, ScriptBuf, Transaction, Txid};
use tokio::sync::oneshot;

use portage_core::{Commitment, PrevId, SerializedKey, TapAddress, VPacket};
use portage_proof::TxConfirmation;

use crate::error::{PorterError, Result};

/// Result of asset-level coin selection for an address send.
#[derive(Debug, Clone)]
pub struct FundSendResult {
    /// The funded virtual packet describing the transfer.
    pub packet: VPacket,
    /// The full commitment of every selected input, keyed by its prev ID.
    pub input_commitments: HashMap<PrevId, Commitment>,
}

/// Parameters for anchoring a set of virtual packets into one Bitcoin
/// transaction.
///
/// The packets are borrowed mutably because anchoring populates each
/// output's proof suffix.
pub struct AnchorVTxnsParams<'a> {
    /// Fee rate to fund the anchor transaction at.
    pub fee_rate: FeeRate,
    /// The active packets of the transfer.
    pub active_packets: &'a mut [VPacket],
    /// The passive packets re-anchoring co-resident assets.
    pub passive_packets: &'a mut [VPacket],
}

/// The funded and signed Bitcoin anchor transaction, together with the
/// wallet UTXOs it locked while funding.
#[derive(Debug, Clone)]
pub struct AnchorTransaction {
    /// The signed anchor transaction.
    pub tx: Transaction,
    /// Wallet inputs locked for this transaction. Released explicitly on
    /// terminal pre-broadcast failure; owned by the lease afterwards.
    pub locked_utxos: Vec<OutPoint>,
    /// Fee rate the transaction was funded at.
    pub fee_rate: FeeRate,
}

/// The asset-level wallet: funds, signs and anchors virtual transactions.
#[async_trait]
pub trait AssetWallet: Send + Sync {
    /// Perform taproot-asset-level coin selection for a send to the given
    /// addresses and return the funded virtual packet.
    async fn fund_address_send(&self, receivers: &[TapAddress]) -> Result<FundSendResult>;

    /// Sign every input of the given virtual packet, populating the witness
    /// data of its outputs.
    async fn sign_virtual_packet(&self, packet: &mut VPacket) -> Result<()>;

    /// Create passive packets for the assets co-resident in the consumed
    /// commitments that are not themselves being transferred.
    async fn create_passive_assets(
        &self,
        active_packets: &[VPacket],
        input_commitments: &HashMap<PrevId, Commitment>,
    ) -> Result<Vec<VPacket>>;

    /// Sign the given passive packets.
    async fn sign_passive_assets(&self, passive_packets: &mut [VPacket]) -> Result<()>;

    /// Build the funded, signed Bitcoin transaction committing to the
    /// outputs of all active and passive packets.
    async fn anchor_virtual_transactions(
        &self,
        params: AnchorVTxnsParams<'_>,
    ) -> Result<AnchorTransaction>;
}

/// The Bitcoin-level wallet operations the porter needs.
#[async_trait]
pub trait WalletAnchor: Send + Sync {
    /// Import a taproot output key so the wallet watches the anchor output
    /// for spends. Implementations report a re-import of a known output
    /// with an error containing "already exists".
    async fn import_taproot_output(&self, output_key: [u8; 32]) -> Result<()>;

    /// Release a UTXO lock acquired while funding an anchor transaction.
    async fn unlock_input(&self, out_point: OutPoint) -> Result<()>;
}

/// Decides whether a raw key belongs to this daemon's wallet.
pub trait KeyRing: Send + Sync {
    /// Whether the given raw (pre-tweak) key can be derived by the local
    /// wallet. Must be deterministic.
    fn is_local_key(&self, raw_key: &SerializedKey) -> bool;
}

/// A pending confirmation notification.
///
/// The sender side delivers exactly one message: the confirmation, or the
/// error that ended the subscription.
pub struct ConfSubscription {
    /// Resolves once the watched transaction confirms.
    pub confirmed: oneshot::Receiver<Result<TxConfirmation>>,
}

/// Bridge to the Bitcoin chain backend.
#[async_trait]
pub trait ChainBridge: Send + Sync {
    /// Estimate a fee rate targeting confirmation within `conf_target`
    /// blocks.
    async fn estimate_fee(&self, conf_target: u32) -> Result<FeeRate>;

    /// The current best block height.
    async fn current_height(&self) -> Result<u32>;

    /// Publish a transaction to the network.
    async fn publish_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Register for a confirmation notification of the given transaction.
    async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        pk_script: ScriptBuf,
        num_confs: u32,
        height_hint: u32,
        include_block: bool,
    ) -> Result<ConfSubscription>;
}

/// Extract the 32-byte taproot output key from a P2TR script.
pub fn taproot_output_key(script: &ScriptBuf) -> Result<[u8; 32]> {
    if !script.is_p2tr() {
        return Err(PorterError::Wallet(format!(
            "anchor output is not P2TR: {script:x}"
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&script.as_bytes()[2..34]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::opcodes::all::OP_PUSHNUM_1;
    use bitcoin::script::{Builder, PushBytesBuf};

    #[test]
    fn test_taproot_output_key() {
        let mut program = [7u8; 32];
        program[0] = 0x11;
        let push = PushBytesBuf::try_from(program.to_vec()).unwrap();
        let script = Builder::new()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(push)
            .into_script();

        assert_eq!(taproot_output_key(&script).unwrap(), program);
    }

    #[test]
    fn test_taproot_output_key_rejects_other_scripts() {
        assert!(taproot_output_key(&ScriptBuf::new()).is_err());
    }
}
