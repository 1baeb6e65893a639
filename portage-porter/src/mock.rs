//! Mock collaborators for testing and development.
//!
//! Every external capability the porter consumes has a configurable
//! in-memory implementation here: controllable failure injection on the
//! chain side, an in-memory export log and proof archive, and a recording
//! courier. Confirmations can be delivered automatically on registration or
//! triggered manually from the test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness as TxWitness,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use portage_core::{
    Asset, AssetId, Commitment, PacketVersion, PrevId, ScriptKey, SerializedKey, TapAddress,
    VInput, VOutput, VPacket, Witness,
};
use portage_proof::{
    AnnotatedProof, ChainLookup, Courier, CourierAddr, CourierDispatch, CourierError,
    CourierEvent, CourierEventKind, GroupVerifier, HeaderVerifier, Locator, MerkleVerifier,
    ProofError, ProofExporter, ProofFile, ProofImporter, ProofUpdateCallback, Recipient,
    ReorgWatcher, TransitionProof, TxConfirmation,
};

use crate::error::{PorterError, Result};
use crate::log::{AssetConfirmEvent, ExportLog, OutboundParcel};
use crate::wallet::{
    AnchorTransaction, AnchorVTxnsParams, AssetWallet, ChainBridge, ConfSubscription,
    FundSendResult, KeyRing, WalletAnchor,
};

/// A deterministic 33-byte key for tests.
fn tagged_key(tag: u8, n: u64) -> [u8; 33] {
    let mut bytes = [0u8; 33];
    bytes[0] = 0x02;
    bytes[1] = tag;
    bytes[25..].copy_from_slice(&n.to_be_bytes());
    bytes
}

/// A deterministic txid for tests.
fn tagged_txid(tag: u8, n: u64) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    Txid::from_byte_array(bytes)
}

/// A syntactically valid block header for mock confirmations.
fn mock_header() -> Header {
    Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 0,
        bits: CompactTarget::from_consensus(0),
        nonce: 0,
    }
}

/// Key ring backed by an explicit set of local raw keys.
#[derive(Default)]
pub struct MockKeyRing {
    local_keys: RwLock<HashSet<SerializedKey>>,
}

impl MockKeyRing {
    /// Create an empty key ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a raw key as derivable by this daemon.
    pub fn add_local_key(&self, raw_key: SerializedKey) {
        self.local_keys.write().insert(raw_key);
    }
}

impl KeyRing for MockKeyRing {
    fn is_local_key(&self, raw_key: &SerializedKey) -> bool {
        self.local_keys.read().contains(raw_key)
    }
}

/// Bitcoin wallet recording imports and unlocks.
#[derive(Default)]
pub struct MockWalletAnchor {
    imported: Mutex<Vec<[u8; 32]>>,
    unlocked: Mutex<Vec<OutPoint>>,
}

impl MockWalletAnchor {
    /// Create a fresh wallet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Taproot output keys imported so far.
    pub fn imported_outputs(&self) -> Vec<[u8; 32]> {
        self.imported.lock().clone()
    }

    /// Inputs unlocked so far.
    pub fn unlocked_inputs(&self) -> Vec<OutPoint> {
        self.unlocked.lock().clone()
    }
}

#[async_trait]
impl WalletAnchor for MockWalletAnchor {
    async fn import_taproot_output(&self, output_key: [u8; 32]) -> Result<()> {
        let mut imported = self.imported.lock();
        if imported.contains(&output_key) {
            return Err(PorterError::Wallet("taproot output already exists".into()));
        }
        imported.push(output_key);
        Ok(())
    }

    async fn unlock_input(&self, out_point: OutPoint) -> Result<()> {
        self.unlocked.lock().push(out_point);
        Ok(())
    }
}

/// Chain bridge with controllable fees, publishes and confirmations.
pub struct MockChainBridge {
    height: AtomicU32,
    fee_rate_sat_kwu: AtomicU64,
    fail_fee: AtomicBool,
    auto_confirm: AtomicBool,
    publish_error: Mutex<Option<PorterError>>,
    published: Mutex<Vec<Transaction>>,
    registrations: Mutex<Vec<Txid>>,
    pending_confs: Mutex<HashMap<Txid, oneshot::Sender<Result<TxConfirmation>>>>,
}

impl Default for MockChainBridge {
    fn default() -> Self {
        Self {
            height: AtomicU32::new(100),
            fee_rate_sat_kwu: AtomicU64::new(250),
            fail_fee: AtomicBool::new(false),
            auto_confirm: AtomicBool::new(false),
            publish_error: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            pending_confs: Mutex::new(HashMap::new()),
        }
    }
}

impl MockChainBridge {
    /// Create a bridge at height 100 with a working fee estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver confirmations immediately upon registration.
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    /// Make fee estimation fail.
    pub fn set_fail_fee(&self, enabled: bool) {
        self.fail_fee.store(enabled, Ordering::SeqCst);
    }

    /// Fail every publish with the given error until cleared.
    pub fn set_publish_error(&self, err: Option<PorterError>) {
        *self.publish_error.lock() = err;
    }

    /// Transactions published so far.
    pub fn published(&self) -> Vec<Transaction> {
        self.published.lock().clone()
    }

    /// Txids a confirmation was registered for.
    pub fn registrations(&self) -> Vec<Txid> {
        self.registrations.lock().clone()
    }

    /// Manually confirm a registered transaction. Returns false if no
    /// registration is pending for the txid.
    pub fn confirm_tx(&self, txid: Txid) -> bool {
        let Some(sender) = self.pending_confs.lock().remove(&txid) else {
            return false;
        };
        let Some(tx) = self
            .published
            .lock()
            .iter()
            .find(|tx| tx.compute_txid() == txid)
            .cloned()
        else {
            return false;
        };
        sender.send(Ok(self.make_confirmation(tx))).is_ok()
    }

    /// Manually fail a registered confirmation.
    pub fn fail_conf(&self, txid: Txid, err: PorterError) -> bool {
        match self.pending_confs.lock().remove(&txid) {
            Some(sender) => sender.send(Err(err)).is_ok(),
            None => false,
        }
    }

    fn make_confirmation(&self, tx: Transaction) -> TxConfirmation {
        let txid = tx.compute_txid();
        TxConfirmation {
            block_hash: BlockHash::from_byte_array(txid.to_byte_array()),
            block_height: self.height.load(Ordering::SeqCst) + 1,
            header: mock_header(),
            tx,
            tx_index: 1,
        }
    }
}

#[async_trait]
impl ChainBridge for MockChainBridge {
    async fn estimate_fee(&self, _conf_target: u32) -> Result<FeeRate> {
        if self.fail_fee.load(Ordering::SeqCst) {
            return Err(PorterError::FeeEstimation("fee estimator offline".into()));
        }
        Ok(FeeRate::from_sat_per_kwu(
            self.fee_rate_sat_kwu.load(Ordering::SeqCst),
        ))
    }

    async fn current_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn publish_transaction(&self, tx: &Transaction) -> Result<()> {
        if let Some(err) = self.publish_error.lock().clone() {
            return Err(err);
        }
        self.published.lock().push(tx.clone());
        Ok(())
    }

    async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        _pk_script: ScriptBuf,
        _num_confs: u32,
        _height_hint: u32,
        _include_block: bool,
    ) -> Result<ConfSubscription> {
        self.registrations.lock().push(txid);
        let (tx, rx) = oneshot::channel();

        let published = self
            .published
            .lock()
            .iter()
            .find(|t| t.compute_txid() == txid)
            .cloned();
        match published {
            Some(anchor_tx) if self.auto_confirm.load(Ordering::SeqCst) => {
                let _ = tx.send(Ok(self.make_confirmation(anchor_tx)));
            }
            _ => {
                self.pending_confs.lock().insert(txid, tx);
            }
        }

        Ok(ConfSubscription { confirmed: rx })
    }
}

#[async_trait]
impl ChainLookup for MockChainBridge {
    async fn best_height(&self) -> std::result::Result<u32, ProofError> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}

/// Asset wallet backed by an explicit set of commitments.
///
/// Coin selection walks the registered commitments in insertion order;
/// change goes to a freshly derived local key that is registered with the
/// shared key ring.
pub struct MockAssetWallet {
    key_ring: Arc<MockKeyRing>,
    commitments: Mutex<Vec<Commitment>>,
    key_counter: AtomicU64,
    utxo_counter: AtomicU64,
    fail_signing: AtomicBool,
    omit_passive: AtomicBool,
}

impl MockAssetWallet {
    /// Create a wallet registering its change keys with the given key ring.
    pub fn new(key_ring: Arc<MockKeyRing>) -> Self {
        Self {
            key_ring,
            commitments: Mutex::new(Vec::new()),
            key_counter: AtomicU64::new(0),
            utxo_counter: AtomicU64::new(0),
            fail_signing: AtomicBool::new(false),
            omit_passive: AtomicBool::new(false),
        }
    }

    /// Register a spendable commitment.
    pub fn add_commitment(&self, commitment: Commitment) {
        self.commitments.lock().push(commitment);
    }

    /// Make every signing call fail.
    pub fn set_fail_signing(&self, enabled: bool) {
        self.fail_signing.store(enabled, Ordering::SeqCst);
    }

    /// Drop passive packets on the floor, producing unbalanced transfers.
    pub fn set_omit_passive(&self, enabled: bool) {
        self.omit_passive.store(enabled, Ordering::SeqCst);
    }

    fn next_local_script_key(&self) -> ScriptKey {
        let n = self.key_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let pub_key = SerializedKey::new(tagged_key(0xC0, n));
        let raw_key = SerializedKey::new(tagged_key(0xD0, n));
        self.key_ring.add_local_key(raw_key);
        ScriptKey::new(pub_key).with_raw_key(raw_key)
    }

    fn witness_packet(packet: &mut VPacket) {
        let witnesses: Vec<Witness> = packet
            .inputs
            .iter()
            .map(|input| Witness {
                prev_id: Some(input.prev_id),
                tx_witness: vec![vec![0xaa; 64]],
            })
            .collect();
        for out in &mut packet.outputs {
            out.asset.witnesses = witnesses.clone();
        }
    }
}

#[async_trait]
impl AssetWallet for MockAssetWallet {
    async fn fund_address_send(&self, receivers: &[TapAddress]) -> Result<FundSendResult> {
        let Some(first) = receivers.first() else {
            return Err(PorterError::CoinSelection("no receivers".into()));
        };
        let asset_id = first.asset_id;
        let target: u64 = receivers.iter().map(|a| a.amount).sum();

        let mut inputs = Vec::new();
        let mut input_commitments = HashMap::new();
        let mut total = 0u64;
        'select: for commitment in self.commitments.lock().iter() {
            for asset in &commitment.assets {
                if asset.asset_id != asset_id
                    || asset.script_key.is_unspendable()
                    || asset.is_burn()
                {
                    continue;
                }

                let prev_id = PrevId {
                    out_point: commitment.anchor_point,
                    asset_id,
                    script_key: asset.script_key.pub_key,
                };
                inputs.push(VInput {
                    prev_id,
                    asset: asset.clone(),
                });
                input_commitments.insert(prev_id, commitment.clone());
                total += asset.amount;
                if total >= target {
                    break 'select;
                }
            }
        }
        if total < target {
            return Err(PorterError::CoinSelection(format!(
                "insufficient asset units: need {target}, have {total}"
            )));
        }

        let mut outputs = Vec::new();
        for (idx, addr) in receivers.iter().enumerate() {
            let script_key = ScriptKey::new(addr.script_key);
            outputs.push(VOutput {
                amount: addr.amount,
                script_key,
                asset: Asset::new(asset_id, addr.amount, script_key),
                anchor_output_index: idx as u32,
                proof_suffix: None,
                proof_courier_addr: addr.proof_courier_addr.clone(),
            });
        }

        let change = total - target;
        if change > 0 {
            let script_key = self.next_local_script_key();
            outputs.push(VOutput {
                amount: change,
                script_key,
                asset: Asset::new(asset_id, change, script_key),
                anchor_output_index: receivers.len() as u32,
                proof_suffix: None,
                proof_courier_addr: None,
            });
        }

        Ok(FundSendResult {
            packet: VPacket::new(PacketVersion::V1, inputs, outputs),
            input_commitments,
        })
    }

    async fn sign_virtual_packet(&self, packet: &mut VPacket) -> Result<()> {
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(PorterError::Signing("asset signer unavailable".into()));
        }
        Self::witness_packet(packet);
        Ok(())
    }

    async fn create_passive_assets(
        &self,
        active_packets: &[VPacket],
        input_commitments: &HashMap<PrevId, Commitment>,
    ) -> Result<Vec<VPacket>> {
        if self.omit_passive.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let consumed: HashSet<PrevId> = active_packets
            .iter()
            .flat_map(|p| p.inputs.iter().map(|i| i.prev_id))
            .collect();

        // Deterministic order regardless of map iteration.
        let mut commitments: Vec<&Commitment> = input_commitments.values().collect();
        commitments.sort_by_key(|c| c.anchor_point);
        commitments.dedup_by_key(|c| c.anchor_point);

        let mut passives = Vec::new();
        for commitment in commitments {
            for asset in &commitment.assets {
                let prev_id = PrevId {
                    out_point: commitment.anchor_point,
                    asset_id: asset.asset_id,
                    script_key: asset.script_key.pub_key,
                };
                if consumed.contains(&prev_id)
                    || asset.script_key.is_unspendable()
                    || asset.is_burn()
                {
                    continue;
                }

                let mut carried = asset.clone();
                carried.witnesses.clear();
                passives.push(VPacket::new(
                    PacketVersion::V1,
                    vec![VInput {
                        prev_id,
                        asset: carried.clone(),
                    }],
                    vec![VOutput {
                        amount: asset.amount,
                        script_key: asset.script_key,
                        asset: carried,
                        anchor_output_index: 0,
                        proof_suffix: None,
                        proof_courier_addr: None,
                    }],
                ));
            }
        }
        Ok(passives)
    }

    async fn sign_passive_assets(&self, passive_packets: &mut [VPacket]) -> Result<()> {
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(PorterError::Signing("asset signer unavailable".into()));
        }
        for packet in passive_packets.iter_mut() {
            Self::witness_packet(packet);
        }
        Ok(())
    }

    async fn anchor_virtual_transactions(
        &self,
        params: AnchorVTxnsParams<'_>,
    ) -> Result<AnchorTransaction> {
        let mut prevouts = Vec::new();
        for packet in params.active_packets.iter().chain(params.passive_packets.iter()) {
            for input in &packet.inputs {
                if !prevouts.contains(&input.prev_id.out_point) {
                    prevouts.push(input.prev_id.out_point);
                }
            }
        }

        // One wallet UTXO sponsors the fees and stays locked.
        let n = self.utxo_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let wallet_utxo = OutPoint {
            txid: tagged_txid(0xEE, n),
            vout: 0,
        };
        prevouts.push(wallet_utxo);

        let num_outputs = params
            .active_packets
            .iter()
            .chain(params.passive_packets.iter())
            .flat_map(|p| p.outputs.iter())
            .map(|o| o.anchor_output_index + 1)
            .max()
            .unwrap_or(1);

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: prevouts
                .iter()
                .map(|op| TxIn {
                    previous_output: *op,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: TxWitness::new(),
                })
                .collect(),
            output: (0..num_outputs)
                .map(|vout| TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: mock_p2tr_script(vout),
                })
                .collect(),
        };
        let txid = tx.compute_txid();

        // Anchoring seals each output with its pending transition proof.
        for packet in params
            .active_packets
            .iter_mut()
            .chain(params.passive_packets.iter_mut())
        {
            for out in &mut packet.outputs {
                let suffix = TransitionProof::new(
                    out.asset.asset_id,
                    out.amount,
                    out.script_key.pub_key,
                    OutPoint {
                        txid,
                        vout: out.anchor_output_index,
                    },
                    out.asset.witnesses.clone(),
                );
                out.proof_suffix = Some(suffix.encode()?);
            }
        }

        Ok(AnchorTransaction {
            tx,
            locked_utxos: vec![wallet_utxo],
            fee_rate: params.fee_rate,
        })
    }
}

/// A P2TR-shaped anchor output script with a deterministic program.
fn mock_p2tr_script(vout: u32) -> ScriptBuf {
    let mut program = [0u8; 32];
    program[..4].copy_from_slice(&vout.to_be_bytes());
    program[31] = 0x51;
    let push = PushBytesBuf::try_from(program.to_vec()).expect("32 bytes always fit a push");
    Builder::new()
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(push)
        .into_script()
}

struct LoggedParcel {
    parcel: OutboundParcel,
    #[allow(dead_code)]
    lease_identifier: [u8; 32],
    #[allow(dead_code)]
    lease_deadline: DateTime<Utc>,
    confirmation: Option<AssetConfirmEvent>,
}

/// In-memory export log keyed by anchor txid.
#[derive(Default)]
pub struct MockExportLog {
    parcels: Mutex<HashMap<Txid, LoggedParcel>>,
    fail_log: AtomicBool,
}

impl MockExportLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `log_pending_parcel` fail.
    pub fn set_fail_log(&self, enabled: bool) {
        self.fail_log.store(enabled, Ordering::SeqCst);
    }

    /// All unconfirmed parcels.
    pub fn pending(&self) -> Vec<OutboundParcel> {
        self.parcels
            .lock()
            .values()
            .filter(|p| p.confirmation.is_none())
            .map(|p| p.parcel.clone())
            .collect()
    }

    /// Whether the parcel with the given anchor txid is confirmed.
    pub fn is_confirmed(&self, anchor_txid: Txid) -> bool {
        self.parcels
            .lock()
            .get(&anchor_txid)
            .is_some_and(|p| p.confirmation.is_some())
    }

    /// The confirmation record of a parcel, if any.
    pub fn confirmation(&self, anchor_txid: Txid) -> Option<AssetConfirmEvent> {
        self.parcels
            .lock()
            .get(&anchor_txid)
            .and_then(|p| p.confirmation.clone())
    }
}

#[async_trait]
impl ExportLog for MockExportLog {
    async fn log_pending_parcel(
        &self,
        parcel: &OutboundParcel,
        lease_identifier: [u8; 32],
        lease_deadline: DateTime<Utc>,
    ) -> Result<()> {
        if self.fail_log.load(Ordering::SeqCst) {
            return Err(PorterError::Persistence("export log unavailable".into()));
        }
        self.parcels.lock().insert(
            parcel.anchor_txid(),
            LoggedParcel {
                parcel: parcel.clone(),
                lease_identifier,
                lease_deadline,
                confirmation: None,
            },
        );
        Ok(())
    }

    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>> {
        Ok(self.pending())
    }

    async fn query_parcels(
        &self,
        anchor_tx_hash: Option<Txid>,
        pending_only: bool,
    ) -> Result<Vec<OutboundParcel>> {
        Ok(self
            .parcels
            .lock()
            .iter()
            .filter(|(txid, logged)| {
                anchor_tx_hash.map_or(true, |hash| hash == **txid)
                    && (!pending_only || logged.confirmation.is_none())
            })
            .map(|(_, logged)| logged.parcel.clone())
            .collect())
    }

    async fn confirm_parcel_delivery(&self, event: &AssetConfirmEvent) -> Result<()> {
        match self.parcels.lock().get_mut(&event.anchor_txid) {
            Some(logged) => {
                logged.confirmation = Some(event.clone());
                Ok(())
            }
            None => Err(PorterError::Persistence(format!(
                "no parcel with anchor txid {}",
                event.anchor_txid
            ))),
        }
    }
}

/// In-memory proof archive keyed by locator.
#[derive(Default)]
pub struct MockProofArchive {
    proofs: Mutex<HashMap<Locator, Vec<u8>>>,
    imports: AtomicUsize,
}

impl MockProofArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a proof without going through the import checks.
    pub fn seed_proof(&self, proof: AnnotatedProof) {
        self.proofs.lock().insert(proof.locator, proof.blob);
    }

    /// Whether the archive holds a proof under the given locator.
    pub fn contains(&self, locator: &Locator) -> bool {
        self.proofs.lock().contains_key(locator)
    }

    /// Number of proofs imported through [`ProofImporter`].
    pub fn import_count(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofImporter for MockProofArchive {
    async fn import_proofs(
        &self,
        header_verifier: &dyn HeaderVerifier,
        merkle_verifier: &dyn MerkleVerifier,
        group_verifier: &dyn GroupVerifier,
        _chain_lookup: &dyn ChainLookup,
        _replace: bool,
        proofs: Vec<AnnotatedProof>,
    ) -> std::result::Result<(), ProofError> {
        for proof in proofs {
            let file = ProofFile::decode(&proof.blob)?;
            file.verify(header_verifier, merkle_verifier, group_verifier)?;
            // Re-imports of identical proofs are tolerated so resumed
            // transfers can replay their storage.
            self.proofs.lock().insert(proof.locator, proof.blob);
            self.imports.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl ProofExporter for MockProofArchive {
    async fn fetch_proof(&self, locator: &Locator) -> std::result::Result<Vec<u8>, ProofError> {
        self.proofs
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| ProofError::Archive(format!("no proof under locator {locator}")))
    }
}

/// Courier handle recording deliveries into the dispatcher.
struct MockCourier {
    recipient: Recipient,
    failure: Option<CourierError>,
    delivered: Arc<Mutex<Vec<(Recipient, AnnotatedProof)>>>,
    subscribers: Mutex<Vec<mpsc::Sender<CourierEvent>>>,
}

#[async_trait]
impl Courier for MockCourier {
    fn set_subscribers(&self, subscribers: Vec<mpsc::Sender<CourierEvent>>) {
        *self.subscribers.lock() = subscribers;
    }

    async fn deliver_proof(&self, proof: &AnnotatedProof) -> std::result::Result<(), CourierError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.delivered
            .lock()
            .push((self.recipient.clone(), proof.clone()));

        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            let _ = subscriber
                .send(CourierEvent::now(CourierEventKind::Delivered))
                .await;
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Dispatcher handing out recording couriers.
#[derive(Default)]
pub struct MockCourierDispatch {
    delivered: Arc<Mutex<Vec<(Recipient, AnnotatedProof)>>>,
    failure: Mutex<Option<CourierError>>,
    opened: AtomicUsize,
}

impl MockCourierDispatch {
    /// Create a dispatcher whose couriers succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail with the given error until cleared.
    pub fn set_failure(&self, failure: Option<CourierError>) {
        *self.failure.lock() = failure;
    }

    /// Proofs delivered so far, with their recipients.
    pub fn delivered(&self) -> Vec<(Recipient, AnnotatedProof)> {
        self.delivered.lock().clone()
    }

    /// Number of courier handles opened.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CourierDispatch for MockCourierDispatch {
    async fn new_courier(
        &self,
        _addr: &CourierAddr,
        recipient: Recipient,
    ) -> std::result::Result<Arc<dyn Courier>, ProofError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockCourier {
            recipient,
            failure: self.failure.lock().clone(),
            delivered: Arc::clone(&self.delivered),
            subscribers: Mutex::new(Vec::new()),
        }))
    }
}

/// Reorg watcher recording the proofs it was handed.
#[derive(Default)]
pub struct MockReorgWatcher {
    watched: Mutex<Vec<TransitionProof>>,
}

impl MockReorgWatcher {
    /// Create an empty watcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Proofs being watched.
    pub fn watched(&self) -> Vec<TransitionProof> {
        self.watched.lock().clone()
    }
}

#[async_trait]
impl ReorgWatcher for MockReorgWatcher {
    async fn watch_proofs(
        &self,
        proofs: Vec<TransitionProof>,
        _on_update: ProofUpdateCallback,
    ) -> std::result::Result<(), ProofError> {
        self.watched.lock().extend(proofs);
        Ok(())
    }

    fn default_update_callback(&self) -> ProofUpdateCallback {
        Arc::new(|_| Ok(()))
    }
}

/// Header verifier accepting every header.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockHeaderVerifier;

impl HeaderVerifier for MockHeaderVerifier {
    fn verify_header(&self, _header: &Header, _height: u32) -> std::result::Result<(), ProofError> {
        Ok(())
    }
}

/// Group verifier accepting every asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockGroupVerifier;

impl GroupVerifier for MockGroupVerifier {
    fn verify_group_key(&self, _asset_id: &AssetId) -> std::result::Result<(), ProofError> {
        Ok(())
    }
}
