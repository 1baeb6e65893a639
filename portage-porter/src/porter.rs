//! The chain porter: engine and state machine driving asset transfers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::Txid;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use portage_core::{is_burn_key, validate_packet_versions, Asset, AssetId, PrevId, SerializedKey, VPacket};
use portage_proof::{
    AnnotatedProof, ChainLookup, CourierAddr, CourierDispatch, CourierError, GroupVerifier,
    HeaderVerifier, Locator, MerkleVerifier, ProofExporter, ProofFile, ProofImporter,
    ProofUpdater, Recipient, ReorgWatcher, TransitionProof,
};

use crate::error::{PorterError, Result};
use crate::events::{AssetSendEvent, EventSubscription, PorterEvent};
use crate::log::{AssetConfirmEvent, ExportLog, OutboundParcel, TransferOutput};
use crate::package::{PackageSnapshot, SendPackage};
use crate::parcel::{Parcel, ParcelKit, PendingParcel};
use crate::state::SendState;
use crate::wallet::{
    taproot_output_key, AnchorVTxnsParams, AssetWallet, ChainBridge, KeyRing, WalletAnchor,
};

/// Compute the identifier the wallet lease of a broadcast parcel is held
/// under by default.
pub fn default_wallet_lease_identifier() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"portage");
    hasher.finalize().into()
}

/// Tunable knobs of the porter, separate from its collaborators.
#[derive(Debug, Clone)]
pub struct PorterTunables {
    /// Confirmation target for fee estimation when a parcel carries no
    /// manual fee rate.
    pub send_conf_target: u32,
    /// How long the wallet lease on the anchor inputs outlives the
    /// checkpoint.
    pub broadcast_coin_lease: chrono::Duration,
    /// Identifier the wallet lease is held under.
    pub wallet_lease_identifier: [u8; 32],
    /// Capacity of the parcel ingress queue.
    pub ingress_capacity: usize,
    /// Capacity of each subscriber's event inbox.
    pub event_inbox_capacity: usize,
}

impl Default for PorterTunables {
    fn default() -> Self {
        Self {
            send_conf_target: 6,
            broadcast_coin_lease: chrono::Duration::minutes(10),
            wallet_lease_identifier: default_wallet_lease_identifier(),
            ingress_capacity: 16,
            event_inbox_capacity: 64,
        }
    }
}

/// The collaborator set and tunables of a [`ChainPorter`].
pub struct PorterConfig {
    /// The asset-level wallet funding and signing virtual transactions.
    pub asset_wallet: Arc<dyn AssetWallet>,
    /// The Bitcoin-level wallet.
    pub wallet: Arc<dyn WalletAnchor>,
    /// Decides output locality.
    pub key_ring: Arc<dyn KeyRing>,
    /// Bridge to the chain backend.
    pub chain_bridge: Arc<dyn ChainBridge>,
    /// The durable log of outbound parcels.
    pub export_log: Arc<dyn ExportLog>,
    /// Writes proofs into the local archive.
    pub proof_writer: Arc<dyn ProofImporter>,
    /// Reads proofs from the local archive.
    pub proof_reader: Arc<dyn ProofExporter>,
    /// Opens per-protocol courier handles.
    pub proof_courier_dispatcher: Arc<dyn CourierDispatch>,
    /// Watches change proofs for reorg eviction.
    pub proof_watcher: Arc<dyn ReorgWatcher>,
    /// Verifies block headers during proof import.
    pub header_verifier: Arc<dyn HeaderVerifier>,
    /// Verifies transaction inclusion during proof import.
    pub merkle_verifier: Arc<dyn MerkleVerifier>,
    /// Verifies genesis group keys during proof import.
    pub group_verifier: Arc<dyn GroupVerifier>,
    /// Chain lookups for proof verification.
    pub chain_lookup: Arc<dyn ChainLookup>,
    /// Process-wide channel for critical, non-parcel-specific failures.
    pub err_tx: Option<mpsc::Sender<PorterError>>,
    /// Tunables.
    pub tunables: PorterTunables,
}

/// The transfer engine.
///
/// The porter accepts parcels on an ingress queue, spawns one runner per
/// parcel that drives the send state machine, persists a checkpoint before
/// broadcast, and resumes unconfirmed parcels from the export log on start.
pub struct ChainPorter {
    inner: Arc<PorterInner>,
}

pub(crate) struct PorterInner {
    cfg: PorterConfig,
    ingress_tx: mpsc::Sender<Parcel>,
    ingress_rx: Mutex<Option<mpsc::Receiver<Parcel>>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<PorterEvent>>>,
    next_subscriber_id: AtomicU64,
    quit: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Prototype guard cloned into every spawned task; dropped on stop so
    /// `tasks_done` closes once all tasks have exited.
    task_guard: Mutex<Option<mpsc::Sender<()>>>,
    tasks_done: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ChainPorter {
    /// Create a new porter from its config.
    pub fn new(cfg: PorterConfig) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(cfg.tunables.ingress_capacity.max(1));
        let (guard_tx, guard_rx) = mpsc::channel(1);
        let (quit, _) = watch::channel(false);

        Self {
            inner: Arc::new(PorterInner {
                cfg,
                ingress_tx,
                ingress_rx: Mutex::new(Some(ingress_rx)),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                quit,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                task_guard: Mutex::new(Some(guard_tx)),
                tasks_done: tokio::sync::Mutex::new(Some(guard_rx)),
            }),
        }
    }

    /// Start the dispatcher and re-queue every pending parcel from the
    /// export log. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("starting chain porter");

        let ingress_rx = self.inner.ingress_rx.lock().take();
        if let Some(rx) = ingress_rx {
            let inner = Arc::clone(&self.inner);
            self.inner
                .spawn_guarded(async move { inner.dispatch_parcels(rx).await });
        }

        // Resume delivery of anything that was checkpointed but never
        // confirmed, through the normal parcel mechanism.
        let pending = self.inner.cfg.export_log.pending_parcels().await?;
        for outbound in pending {
            info!(
                anchor_txid = %outbound.anchor_txid(),
                "attempting to resume delivery"
            );
            let parcel = Parcel::Pending(PendingParcel::new(outbound));
            if self.inner.ingress_tx.send(parcel).await.is_err() {
                return Err(PorterError::ShuttingDown);
            }
        }

        Ok(())
    }

    /// Signal shutdown, wait for every in-flight runner and background
    /// delivery to exit, then deregister all subscribers. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("stopping chain porter");
        let _ = self.inner.quit.send(true);

        // Drop the guard prototype; the done channel closes once the last
        // task guard is gone.
        let guard = self.inner.task_guard.lock().take();
        drop(guard);

        let done_rx = self.inner.tasks_done.lock().await.take();
        if let Some(mut done_rx) = done_rx {
            while done_rx.recv().await.is_some() {}
        }

        self.inner.subscribers.lock().clear();
    }

    /// Request a new transfer. Validates the parcel, enqueues it and blocks
    /// until the anchor transaction has been broadcast, the transfer failed,
    /// or the porter shuts down.
    pub async fn request_shipment(&self, mut parcel: Parcel) -> Result<OutboundParcel> {
        // Catch invalid parcels before any coins are locked or anything is
        // broadcast.
        parcel.validate()?;

        let (kit, responses) = ParcelKit::new();
        parcel.set_kit(kit);

        let mut quit = self.inner.quit.subscribe();
        if *quit.borrow() {
            return Err(PorterError::ShuttingDown);
        }

        tokio::select! {
            res = self.inner.ingress_tx.send(parcel) => {
                if res.is_err() {
                    return Err(PorterError::ShuttingDown);
                }
            }
            _ = quit.changed() => return Err(PorterError::ShuttingDown),
        }

        enum Outcome {
            Resp(std::result::Result<OutboundParcel, tokio::sync::oneshot::error::RecvError>),
            Err(std::result::Result<PorterError, tokio::sync::oneshot::error::RecvError>),
            Quit,
        }

        let mut resp_rx = responses.resp;
        let mut err_rx = responses.err;
        let outcome = tokio::select! {
            res = &mut resp_rx => Outcome::Resp(res),
            err = &mut err_rx => Outcome::Err(err),
            _ = quit.changed() => Outcome::Quit,
        };

        match outcome {
            Outcome::Resp(Ok(outbound)) => Ok(outbound),
            Outcome::Err(Ok(err)) => Err(err),
            // One side of the kit was dropped without a signal; the other
            // side decides, unless the runner was abandoned on shutdown.
            Outcome::Resp(Err(_)) => match err_rx.await {
                Ok(err) => Err(err),
                Err(_) => Err(PorterError::ShuttingDown),
            },
            Outcome::Err(Err(_)) => match resp_rx.await {
                Ok(outbound) => Ok(outbound),
                Err(_) => Err(PorterError::ShuttingDown),
            },
            Outcome::Quit => Err(PorterError::ShuttingDown),
        }
    }

    /// Query the export log for confirmed or pending parcels.
    pub async fn query_parcels(
        &self,
        anchor_tx_hash: Option<Txid>,
        pending_only: bool,
    ) -> Result<Vec<OutboundParcel>> {
        self.inner
            .cfg
            .export_log
            .query_parcels(anchor_tx_hash, pending_only)
            .await
    }

    /// Register a subscriber for future porter events.
    pub fn register_subscriber(&self) -> EventSubscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.inner.cfg.tunables.event_inbox_capacity.max(1));
        self.inner.subscribers.lock().insert(id, tx);
        EventSubscription { id, events: rx }
    }

    /// Remove a subscriber by its ID.
    pub fn remove_subscriber(&self, id: u64) -> Result<()> {
        match self.inner.subscribers.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(PorterError::Internal(format!(
                "subscriber with ID {id} not found"
            ))),
        }
    }
}

impl PorterInner {
    /// Spawn a task that is joined by [`ChainPorter::stop`].
    fn spawn_guarded<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.task_guard.lock().clone();
        let Some(guard) = guard else {
            // Already stopping; the work would be abandoned anyway.
            return;
        };
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    fn is_shutting_down(&self) -> bool {
        *self.quit.subscribe().borrow()
    }

    /// Publish an event to every subscriber.
    ///
    /// The sender set is snapshotted under the lock, but each send happens
    /// outside it; a subscriber with a full inbox stalls publication.
    async fn publish_event(&self, event: PorterEvent) {
        let senders: Vec<_> = self.subscribers.lock().values().cloned().collect();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    /// The dispatcher: single consumer of the ingress queue, spawning one
    /// runner per parcel. Never blocks on a single parcel's progress.
    async fn dispatch_parcels(self: Arc<Self>, mut ingress: mpsc::Receiver<Parcel>) {
        let mut quit = self.quit.subscribe();
        loop {
            // A subscription taken after the quit signal fired never sees a
            // change; check the level explicitly.
            if *quit.borrow() {
                return;
            }
            tokio::select! {
                req = ingress.recv() => match req {
                    Some(parcel) => {
                        let pkg = parcel.pkg();
                        let inner = Arc::clone(&self);
                        self.spawn_guarded(async move {
                            inner.advance_state(pkg).await;
                        });
                    }
                    None => {
                        if let Some(err_tx) = &self.cfg.err_tx {
                            let _ = err_tx
                                .send(PorterError::Internal(
                                    "parcel ingress queue closed".into(),
                                ))
                                .await;
                        }
                        return;
                    }
                },
                _ = quit.changed() => return,
            }
        }
    }

    /// Drive a package through the state machine until it reaches a
    /// terminal state or fails.
    async fn advance_state(self: Arc<Self>, mut pkg: SendPackage) {
        while pkg.send_state < SendState::Complete {
            info!(state = %pkg.send_state, "executing send state");

            // Honor the quit signal at state boundaries.
            if self.is_shutting_down() {
                return;
            }

            let executed = pkg.send_state;
            match self.state_step(&mut pkg).await {
                Ok(()) => {
                    // The final state notifies its subscribers from the
                    // detached delivery task instead.
                    if pkg.send_state < SendState::Complete {
                        let event = AssetSendEvent::from_snapshot(executed, &pkg.snapshot());
                        self.publish_event(PorterEvent::Send(event)).await;
                    }
                }
                Err(PorterError::ShuttingDown) => {
                    debug!(state = %executed, "shutting down, send state left intact");
                    return;
                }
                Err(err) => {
                    error!(state = %executed, error = %err, "error evaluating send state");

                    // Pre-checkpoint failures release the wallet's locks;
                    // after the checkpoint the lease owns them.
                    if executed <= SendState::StorePreBroadcast {
                        self.unlock_inputs(&mut pkg).await;
                    }

                    let shared = Arc::new(err.clone());
                    pkg.kit_mut().deliver_err(err);
                    let event =
                        AssetSendEvent::from_error(shared, executed, &pkg.snapshot());
                    self.publish_event(PorterEvent::Send(event)).await;
                    return;
                }
            }
        }
    }

    /// Execute a single state of the pipeline.
    async fn state_step(self: &Arc<Self>, pkg: &mut SendPackage) -> Result<()> {
        match pkg.send_state {
            // Perform asset-level coin selection to see whether the send is
            // possible at all.
            SendState::VirtualCommitmentSelect => {
                let Parcel::Address(addr_parcel) = &pkg.parcel else {
                    return Err(PorterError::WrongParcelVariant(
                        "virtual commitment selection requires an address parcel".into(),
                    ));
                };

                let fund_result = self
                    .cfg
                    .asset_wallet
                    .fund_address_send(&addr_parcel.dest_addrs)
                    .await?;

                pkg.virtual_packets = vec![fund_result.packet];
                pkg.input_commitments = fund_result.input_commitments;
                pkg.send_state = SendState::VirtualSign;
                Ok(())
            }

            // Sign the virtual transactions on the asset layer.
            SendState::VirtualSign => {
                validate_packet_versions(&pkg.virtual_packets)?;

                for packet in &mut pkg.virtual_packets {
                    log_packet(packet, "generating asset witnesses");
                    self.cfg.asset_wallet.sign_virtual_packet(packet).await?;
                }

                pkg.send_state = SendState::AnchorSign;
                Ok(())
            }

            // Build passive packets and the signed Bitcoin anchor
            // transaction committing to all of them.
            SendState::AnchorSign => {
                let manual_rate = match &pkg.parcel {
                    Parcel::Address(p) => p.transfer_fee_rate,
                    _ => None,
                };
                let fee_rate = match manual_rate {
                    Some(rate) => {
                        info!("sending with manual fee rate");
                        rate
                    }
                    None => {
                        self.cfg
                            .chain_bridge
                            .estimate_fee(self.cfg.tunables.send_conf_target)
                            .await?
                    }
                };
                info!(
                    sat_per_kwu = fee_rate.to_sat_per_kwu(),
                    "sending with fee rate"
                );

                for packet in &pkg.virtual_packets {
                    log_packet(packet, "constructing new asset commitments");
                }

                pkg.passive_assets = self
                    .cfg
                    .asset_wallet
                    .create_passive_assets(&pkg.virtual_packets, &pkg.input_commitments)
                    .await?;
                debug!(count = pkg.passive_assets.len(), "signing passive assets");
                self.cfg
                    .asset_wallet
                    .sign_passive_assets(&mut pkg.passive_assets)
                    .await?;

                let anchor_tx = {
                    let params = AnchorVTxnsParams {
                        fee_rate,
                        active_packets: &mut pkg.virtual_packets,
                        passive_packets: &mut pkg.passive_assets,
                    };
                    self.cfg.asset_wallet.anchor_virtual_transactions(params).await?
                };
                pkg.anchor_tx = Some(anchor_tx);

                // Assets committed to the inputs but pruned on purpose:
                // burns and tombstones.
                let mut pruned: HashMap<bitcoin::OutPoint, Vec<Asset>> = HashMap::new();
                for (prev_id, commitment) in &pkg.input_commitments {
                    pruned
                        .entry(prev_id.out_point)
                        .or_default()
                        .extend(commitment.unspendable_assets().cloned());
                }

                if let Err(err) = pkg.validate_ready_for_publish(&pruned) {
                    self.unlock_inputs(pkg).await;
                    return Err(err);
                }

                pkg.send_state = SendState::StorePreBroadcast;
                Ok(())
            }

            // The durable checkpoint: persist the parcel before broadcast.
            // Every state after this one must be idempotent against restart.
            SendState::StorePreBroadcast => {
                let current_height = match self.cfg.chain_bridge.current_height().await {
                    Ok(height) => height,
                    Err(err) => {
                        self.unlock_inputs(pkg).await;
                        return Err(err);
                    }
                };

                let anchor_tx = pkg
                    .anchor_tx
                    .clone()
                    .ok_or_else(|| PorterError::Internal("no anchor transaction built".into()))?;

                let key_ring = Arc::clone(&self.cfg.key_ring);
                let is_local = move |raw_key: &SerializedKey| key_ring.is_local_key(raw_key);
                let parcel = match OutboundParcel::from_send_components(
                    current_height,
                    &pkg.virtual_packets,
                    &anchor_tx,
                    &pkg.passive_assets,
                    &is_local,
                ) {
                    Ok(parcel) => parcel,
                    Err(err) => {
                        self.unlock_inputs(pkg).await;
                        return Err(PorterError::Persistence(format!(
                            "unable to prepare parcel for storage: {err}"
                        )));
                    }
                };

                info!(anchor_txid = %parcel.anchor_txid(), "committing pending parcel to disk");
                let lease_deadline = Utc::now() + self.cfg.tunables.broadcast_coin_lease;
                if let Err(err) = self
                    .cfg
                    .export_log
                    .log_pending_parcel(
                        &parcel,
                        self.cfg.tunables.wallet_lease_identifier,
                        lease_deadline,
                    )
                    .await
                {
                    self.unlock_inputs(pkg).await;
                    return Err(PorterError::Persistence(format!(
                        "unable to write send package to disk: {err}"
                    )));
                }

                pkg.outbound = Some(parcel);
                pkg.send_state = SendState::Broadcast;
                Ok(())
            }

            // Import local anchor outputs, then publish the transaction.
            SendState::Broadcast => {
                let outbound = pkg
                    .outbound
                    .clone()
                    .ok_or_else(|| PorterError::Internal("no outbound parcel to broadcast".into()))?;

                if let Err(err) = self.import_local_outputs(&outbound).await {
                    self.unlock_inputs(pkg).await;
                    return Err(PorterError::Wallet(format!(
                        "unable to import local outputs: {err}"
                    )));
                }

                let txid = outbound.anchor_txid();
                info!(%txid, "broadcasting new transfer tx");
                match self.cfg.chain_bridge.publish_transaction(&outbound.anchor_tx).await {
                    // A double spend will never make it into the mempool or
                    // chain. Release the fee inputs and park the transfer.
                    Err(err @ PorterError::DoubleSpend(_)) => {
                        self.unlock_inputs(pkg).await;
                        pkg.send_state = SendState::Failed;
                        return Err(err);
                    }
                    // Other publish failures are safe to retry on restart.
                    Err(err) => {
                        return Err(PorterError::Publish(format!(
                            "unable to broadcast transaction {txid}: {err}"
                        )));
                    }
                    Ok(()) => {}
                }

                // The anchor is out; unblock the shipment request.
                pkg.kit_mut().deliver_response(outbound);
                pkg.send_state = SendState::WaitTxConf;
                Ok(())
            }

            SendState::WaitTxConf => self.wait_for_transfer_tx_conf(pkg).await,

            SendState::StoreProofs => self.store_proofs(pkg).await,

            // Mark complete first so the runner loop exits, then deliver
            // the receiver proofs from a detached task.
            SendState::TransferProofs => {
                pkg.send_state = SendState::Complete;

                let snapshot = pkg.snapshot();
                let inner = Arc::clone(self);
                self.spawn_guarded(async move {
                    if let Err(err) = inner.transfer_receiver_proofs(&snapshot).await {
                        error!(error = %err, "unable to transfer receiver proof");
                        let event = AssetSendEvent::from_error(
                            Arc::new(err),
                            SendState::TransferProofs,
                            &snapshot,
                        );
                        inner.publish_event(PorterEvent::Send(event)).await;
                    }
                });
                Ok(())
            }

            SendState::Complete | SendState::Failed => Ok(()),
        }
    }

    /// Block until the anchor transaction confirms, the notifier fails or
    /// the porter shuts down.
    async fn wait_for_transfer_tx_conf(&self, pkg: &mut SendPackage) -> Result<()> {
        let outbound = pkg
            .outbound
            .as_ref()
            .ok_or_else(|| PorterError::Internal("no outbound parcel to confirm".into()))?;
        let txid = outbound.anchor_txid();
        info!(transfer_txid = %txid, "waiting for confirmation of transfer tx");

        let anchor_script = outbound
            .anchor_tx
            .output
            .first()
            .map(|out| out.script_pubkey.clone())
            .ok_or_else(|| PorterError::Internal("anchor transaction has no outputs".into()))?;

        let subscription = self
            .cfg
            .chain_bridge
            .register_confirmations_ntfn(
                txid,
                anchor_script,
                1,
                outbound.anchor_tx_height_hint,
                true,
            )
            .await
            .map_err(|err| {
                PorterError::Notifier(format!("unable to register for package tx conf: {err}"))
            })?;

        let mut quit = self.quit.subscribe();
        if *quit.borrow() {
            return Err(PorterError::ShuttingDown);
        }
        tokio::select! {
            conf = subscription.confirmed => match conf {
                Ok(Ok(conf_event)) => {
                    debug!(block_hash = %conf_event.block_hash, "got chain confirmation");
                    pkg.conf_event = Some(conf_event);
                    pkg.send_state = SendState::StoreProofs;
                    Ok(())
                }
                Ok(Err(err)) => Err(PorterError::Notifier(format!(
                    "error whilst waiting for package tx confirmation: {err}"
                ))),
                Err(_) => Err(PorterError::Notifier(
                    "confirmation subscription closed without event".into(),
                )),
            },
            _ = quit.changed() => {
                debug!("skipping tx confirmation, porter shutting down");
                Err(PorterError::ShuttingDown)
            }
        }
    }

    /// Build the updated proof files and import them into the archive.
    ///
    /// Deliberately ignores the quit signal: shutdown is deferred until the
    /// proofs are durably stored.
    async fn store_proofs(&self, pkg: &mut SendPackage) -> Result<()> {
        let outbound = pkg
            .outbound
            .clone()
            .ok_or_else(|| PorterError::Internal("no outbound parcel to prove".into()))?;
        let conf = pkg
            .conf_event
            .clone()
            .ok_or_else(|| PorterError::Internal("no confirmation event recorded".into()))?;

        let updater = ProofUpdater::new(self.cfg.proof_reader.as_ref());

        // Passive assets are re-anchored whether or not anything was
        // actively transferred.
        let mut passive_files = Vec::with_capacity(outbound.passive_assets.len());
        let mut passive_suffixes = Vec::with_capacity(outbound.passive_assets.len());
        for packet in &outbound.passive_assets {
            let passive_out = packet.outputs.first().ok_or_else(|| {
                PorterError::Internal("passive packet without outputs".into())
            })?;
            let suffix_bytes = passive_out.proof_suffix.as_ref().ok_or_else(|| {
                PorterError::Internal("passive output without proof suffix".into())
            })?;

            let mut suffix = TransitionProof::decode(suffix_bytes)?;
            let inputs = packet.input_prev_ids();
            let annotated = updater
                .update_proof_file(&inputs, &mut suffix, passive_out.script_key.pub_key, &conf)
                .await?;

            passive_files.push(annotated);
            passive_suffixes.push(suffix);
        }

        if !passive_files.is_empty() {
            info!(
                count = passive_files.len(),
                "importing passive asset proofs into local archive"
            );
            self.import_proofs(passive_files).await?;

            // Re-derive passive proofs if the anchor is reorged out.
            self.cfg
                .proof_watcher
                .watch_proofs(
                    passive_suffixes,
                    self.cfg.proof_watcher.default_update_callback(),
                )
                .await?;
        }

        // A passive-only carry (the anchor UTXO was re-created but no asset
        // moved) produces no active proofs.
        if outbound.inputs.is_empty() {
            debug!("not updating proofs as there are no active transfers");
            pkg.send_state = SendState::TransferProofs;
            return Ok(());
        }

        pkg.final_proofs = HashMap::with_capacity(outbound.outputs.len());
        for (idx, out) in outbound.outputs.iter().enumerate() {
            let mut suffix = TransitionProof::decode(&out.proof_suffix)?;

            // Restrict the inputs to the ones this output actually spends,
            // keeping the deterministic parcel input order.
            let witness_prev_ids = suffix.witness_prev_ids();
            let inputs_for_asset: Vec<PrevId> = outbound
                .inputs
                .iter()
                .map(|input| input.prev_id)
                .filter(|prev_id| witness_prev_ids.contains(prev_id))
                .collect();

            let annotated = updater
                .update_proof_file(&inputs_for_asset, &mut suffix, out.script_key.pub_key, &conf)
                .await?;

            // Validate the assembled file before it enters the archive.
            ProofFile::decode(&annotated.blob)?.verify(
                self.cfg.header_verifier.as_ref(),
                self.cfg.merkle_verifier.as_ref(),
                self.cfg.group_verifier.as_ref(),
            )?;

            info!(output = idx, "importing output proof into local archive");
            self.import_proofs(vec![annotated.clone()]).await?;
            pkg.final_proofs.insert(out.script_key.pub_key, annotated);

            // Only change proofs are watched for reorgs; receivers watch
            // their own side, so no re-send is needed for outbound outputs.
            if out.script_key.raw_key.is_some() && out.script_key_local {
                self.cfg
                    .proof_watcher
                    .watch_proofs(
                        vec![suffix],
                        self.cfg.proof_watcher.default_update_callback(),
                    )
                    .await?;
            }
        }

        pkg.send_state = SendState::TransferProofs;
        Ok(())
    }

    async fn import_proofs(&self, proofs: Vec<AnnotatedProof>) -> Result<()> {
        self.cfg
            .proof_writer
            .import_proofs(
                self.cfg.header_verifier.as_ref(),
                self.cfg.merkle_verifier.as_ref(),
                self.cfg.group_verifier.as_ref(),
                self.cfg.chain_lookup.as_ref(),
                false,
                proofs,
            )
            .await?;
        Ok(())
    }

    /// Deliver every receiver proof in parallel, then confirm the parcel in
    /// the export log and publish the final event.
    async fn transfer_receiver_proofs(self: &Arc<Self>, snapshot: &PackageSnapshot) -> Result<()> {
        let outbound = snapshot
            .outbound
            .clone()
            .ok_or_else(|| PorterError::Internal("no outbound parcel to deliver".into()))?;
        let conf = snapshot
            .conf_event
            .clone()
            .ok_or_else(|| PorterError::Internal("no confirmation event recorded".into()))?;

        let mut deliveries = Vec::with_capacity(outbound.outputs.len());
        for out in outbound.outputs.clone() {
            let inner = Arc::clone(self);
            let final_proofs = snapshot.final_proofs.clone();
            deliveries.push(tokio::spawn(async move {
                inner.deliver_proof_for_output(&out, &final_proofs).await
            }));
        }
        for delivery in deliveries {
            match delivery.await {
                Ok(result) => result?,
                Err(err) => {
                    return Err(PorterError::Internal(format!(
                        "proof delivery task failed: {err}"
                    )))
                }
            }
        }

        let txid = outbound.anchor_txid();
        info!(%txid, "marking parcel as confirmed");

        // Load the sealed passive proof files back from the archive for the
        // confirmation record.
        let mut passive_proof_files: HashMap<AssetId, Vec<AnnotatedProof>> = HashMap::new();
        for packet in &outbound.passive_assets {
            let passive_out = packet.outputs.first().ok_or_else(|| {
                PorterError::Internal("passive packet without outputs".into())
            })?;
            let suffix_bytes = passive_out.proof_suffix.as_ref().ok_or_else(|| {
                PorterError::Internal("passive output without proof suffix".into())
            })?;
            let suffix = TransitionProof::decode(suffix_bytes)?;

            let locator = Locator {
                asset_id: passive_out.asset.asset_id,
                script_key: passive_out.script_key.pub_key,
                out_point: Some(suffix.out_point()),
            };
            let blob = self.cfg.proof_reader.fetch_proof(&locator).await?;
            passive_proof_files
                .entry(passive_out.asset.asset_id)
                .or_default()
                .push(AnnotatedProof { locator, blob });
        }

        self.cfg
            .export_log
            .confirm_parcel_delivery(&AssetConfirmEvent {
                anchor_txid: txid,
                block_hash: conf.block_hash,
                block_height: conf.block_height,
                tx_index: conf.tx_index,
                final_proofs: snapshot.final_proofs.clone(),
                passive_asset_proof_files: passive_proof_files,
            })
            .await
            .map_err(|err| {
                PorterError::Persistence(format!(
                    "unable to log parcel delivery confirmation: {err}"
                ))
            })?;

        let event = AssetSendEvent::from_snapshot(SendState::Complete, snapshot);
        self.publish_event(PorterEvent::Send(event)).await;
        Ok(())
    }

    /// Deliver a single output's proof, or skip it if the output never
    /// leaves this daemon.
    async fn deliver_proof_for_output(
        self: &Arc<Self>,
        out: &TransferOutput,
        final_proofs: &HashMap<SerializedKey, AnnotatedProof>,
    ) -> Result<()> {
        let key = out.script_key.pub_key;

        // Outputs going to our own wallet need no courier.
        if out.script_key.raw_key.is_some() && out.script_key_local {
            debug!(script_key = %key, "not transferring proof for local output");
            return Ok(());
        }

        // Tombstones left behind by splits.
        if out.script_key.is_unspendable() {
            debug!(script_key = %key, "not transferring proof for un-spendable output");
            return Ok(());
        }

        // Burns are always kept local too.
        if let Some(witness) = out.witness_data.first() {
            if is_burn_key(&key, witness) {
                debug!(script_key = %key, "not transferring proof for burn output");
                return Ok(());
            }
        }

        // Without a courier address this is an interactive send; the
        // recipient learns of the proof through another channel.
        let Some(addr) = &out.proof_courier_addr else {
            debug!(
                script_key = %key,
                "not transferring proof for output without proof courier address"
            );
            return Ok(());
        };

        let receiver_proof = final_proofs.get(&key).ok_or_else(|| {
            PorterError::Internal(format!("no proof found for output with script key {key}"))
        })?;

        debug!(script_key = %key, "attempting to deliver proof");

        let courier_addr = CourierAddr::parse(addr)?;
        let recipient = Recipient {
            script_key: key,
            asset_id: receiver_proof.locator.asset_id,
            amount: out.amount,
        };
        let courier = self
            .cfg
            .proof_courier_dispatcher
            .new_courier(&courier_addr, recipient)
            .await?;

        // Bridge courier events onto the porter bus for the current
        // subscribers.
        let (event_tx, mut event_rx) =
            mpsc::channel(self.cfg.tunables.event_inbox_capacity.max(1));
        courier.set_subscribers(vec![event_tx]);
        let forwarder = Arc::clone(self);
        self.spawn_guarded(async move {
            while let Some(event) = event_rx.recv().await {
                forwarder.publish_event(PorterEvent::Courier(event)).await;
            }
        });

        let result = courier.deliver_proof(receiver_proof).await;
        courier.close().await;

        match result {
            // The courier keeps retrying on its own; nothing to do here.
            Err(CourierError::Backoff(reason)) => {
                warn!(script_key = %key, %reason, "courier backing off, will retry delivery");
                Ok(())
            }
            Err(err) => Err(PorterError::Courier(format!(
                "failed to deliver proof via courier service: {err}"
            ))),
            Ok(()) => Ok(()),
        }
    }

    /// Import the anchor output keys of all local outputs into the Bitcoin
    /// wallet so it watches them for spends.
    async fn import_local_outputs(&self, parcel: &OutboundParcel) -> Result<()> {
        for out in &parcel.outputs {
            if !out.script_key_local {
                continue;
            }

            let anchor_output = parcel
                .anchor_tx
                .output
                .get(out.anchor_outpoint.vout as usize)
                .ok_or_else(|| {
                    PorterError::Internal(format!(
                        "local output anchors to missing tx output {}",
                        out.anchor_outpoint.vout
                    ))
                })?;
            let output_key = taproot_output_key(&anchor_output.script_pubkey)?;

            match self.cfg.wallet.import_taproot_output(output_key).await {
                Ok(()) => {}
                // On restart the output is already known to the wallet.
                Err(err) if err.to_string().contains("already exists") => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Release every wallet UTXO still locked for this package. Draining
    /// makes repeated calls no-ops.
    async fn unlock_inputs(&self, pkg: &mut SendPackage) {
        let Some(anchor) = pkg.anchor_tx.as_mut() else {
            return;
        };
        for out_point in anchor.locked_utxos.drain(..) {
            if let Err(err) = self.cfg.wallet.unlock_input(out_point).await {
                warn!(outpoint = %out_point, error = %err, "unable to unlock input");
            }
        }
    }
}

/// Log the first recipient of a packet for an action.
fn log_packet(packet: &VPacket, action: &str) {
    if let Some(out) = packet.outputs.first() {
        debug!(script_key = %out.script_key.pub_key, "{action} for send");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        MockAssetWallet, MockChainBridge, MockCourierDispatch, MockExportLog, MockGroupVerifier,
        MockHeaderVerifier, MockKeyRing, MockProofArchive, MockReorgWatcher, MockWalletAnchor,
    };
    use crate::parcel::AddressParcel;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::Header;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, BlockHash, CompactTarget, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction,
        TxIn, TxMerkleNode, TxOut, Witness as TxWitness,
    };
    use portage_core::{
        Asset, Commitment, PacketVersion, ScriptKey, TapAddress, VInput, VOutput,
        Witness, NUMS_KEY,
    };
    use portage_proof::file::FileVersion;
    use portage_proof::{AnchorConfirmation, DefaultMerkleVerifier, TxConfirmation};
    use std::time::Duration;

    struct TestEnv {
        key_ring: Arc<MockKeyRing>,
        asset_wallet: Arc<MockAssetWallet>,
        wallet: Arc<MockWalletAnchor>,
        chain_bridge: Arc<MockChainBridge>,
        export_log: Arc<MockExportLog>,
        archive: Arc<MockProofArchive>,
        courier: Arc<MockCourierDispatch>,
        watcher: Arc<MockReorgWatcher>,
    }

    impl TestEnv {
        fn new() -> Self {
            let key_ring = Arc::new(MockKeyRing::new());
            Self {
                asset_wallet: Arc::new(MockAssetWallet::new(Arc::clone(&key_ring))),
                key_ring,
                wallet: Arc::new(MockWalletAnchor::new()),
                chain_bridge: Arc::new(MockChainBridge::new()),
                export_log: Arc::new(MockExportLog::new()),
                archive: Arc::new(MockProofArchive::new()),
                courier: Arc::new(MockCourierDispatch::new()),
                watcher: Arc::new(MockReorgWatcher::new()),
            }
        }

        fn config(&self) -> PorterConfig {
            PorterConfig {
                asset_wallet: self.asset_wallet.clone(),
                wallet: self.wallet.clone(),
                key_ring: self.key_ring.clone(),
                chain_bridge: self.chain_bridge.clone(),
                export_log: self.export_log.clone(),
                proof_writer: self.archive.clone(),
                proof_reader: self.archive.clone(),
                proof_courier_dispatcher: self.courier.clone(),
                proof_watcher: self.watcher.clone(),
                header_verifier: Arc::new(MockHeaderVerifier),
                merkle_verifier: Arc::new(DefaultMerkleVerifier),
                group_verifier: Arc::new(MockGroupVerifier),
                chain_lookup: self.chain_bridge.clone(),
                err_tx: None,
                tunables: PorterTunables::default(),
            }
        }

        async fn started_porter(&self) -> ChainPorter {
            let porter = ChainPorter::new(self.config());
            porter.start().await.unwrap();
            porter
        }

        /// Register a commitment holding one spendable asset (and
        /// optionally one passive co-resident), seeding genesis proof files
        /// for everything spendable.
        fn add_commitment_with(
            &self,
            asset_id: AssetId,
            amount: u64,
            tag: u8,
            passive: Option<(AssetId, u64)>,
        ) -> (PrevId, Option<PrevId>) {
            let anchor_point = OutPoint {
                txid: Txid::from_byte_array([tag; 32]),
                vout: 0,
            };
            let script_key = ScriptKey::new(SerializedKey::new([tag; 33]));
            let mut assets = vec![Asset::new(asset_id, amount, script_key)];
            let active_prev = PrevId {
                out_point: anchor_point,
                asset_id,
                script_key: script_key.pub_key,
            };

            let passive_prev = passive.map(|(passive_id, passive_amount)| {
                let passive_key = ScriptKey::new(SerializedKey::new([tag ^ 0x80; 33]));
                assets.push(Asset::new(passive_id, passive_amount, passive_key));
                PrevId {
                    out_point: anchor_point,
                    asset_id: passive_id,
                    script_key: passive_key.pub_key,
                }
            });

            let commitment = Commitment::new(anchor_point, assets);
            self.asset_wallet.add_commitment(commitment.clone());
            for asset in &commitment.assets {
                seed_genesis_proof(&self.archive, &commitment, asset);
            }

            (active_prev, passive_prev)
        }

        fn add_asset_utxo(&self, asset_id: AssetId, amount: u64, tag: u8) -> PrevId {
            self.add_commitment_with(asset_id, amount, tag, None).0
        }
    }

    fn seed_genesis_proof(archive: &MockProofArchive, commitment: &Commitment, asset: &Asset) {
        let mut genesis = TransitionProof::new(
            asset.asset_id,
            asset.amount,
            asset.script_key.pub_key,
            commitment.anchor_point,
            vec![Witness {
                prev_id: None,
                tx_witness: vec![],
            }],
        );
        genesis.anchor = Some(AnchorConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 1,
            header: test_header(),
            tx_index: 0,
        });

        let mut file = ProofFile::new(FileVersion::V0);
        file.append(genesis).unwrap();
        archive.seed_proof(AnnotatedProof {
            locator: Locator {
                asset_id: asset.asset_id,
                script_key: asset.script_key.pub_key,
                out_point: Some(commitment.anchor_point),
            },
            blob: file.encode().unwrap(),
        });
    }

    fn test_header() -> Header {
        Header {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0),
            nonce: 0,
        }
    }

    fn courier_addr(asset_id: AssetId, amount: u64, key_tag: u8) -> TapAddress {
        TapAddress {
            asset_id,
            amount,
            script_key: SerializedKey::new([key_tag; 33]),
            proof_courier_addr: Some("hashmail://proofs.example.com:443".to_string()),
        }
    }

    fn interactive_addr(asset_id: AssetId, amount: u64, key_tag: u8) -> TapAddress {
        TapAddress {
            asset_id,
            amount,
            script_key: SerializedKey::new([key_tag; 33]),
            proof_courier_addr: None,
        }
    }

    async fn next_complete(events: &mut EventSubscription) -> AssetSendEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.events.recv().await {
                    Some(PorterEvent::Send(ev)) if ev.is_error() => {
                        panic!("unexpected error in state {}: {:?}", ev.state, ev.error)
                    }
                    Some(PorterEvent::Send(ev)) if ev.state == SendState::Complete => return ev,
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("transfer did not complete in time")
    }

    async fn next_error(events: &mut EventSubscription) -> AssetSendEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.events.recv().await {
                    Some(PorterEvent::Send(ev)) if ev.is_error() => return ev,
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("no error event arrived in time")
    }

    #[tokio::test]
    async fn test_single_recipient_send() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([1; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x10);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let addr = courier_addr(asset_id, 5_000, 0x40);
        let parcel = Parcel::Address(AddressParcel::new(vec![addr.clone()], None));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        assert_eq!(outbound.inputs.len(), 1);
        assert_eq!(outbound.outputs.len(), 1);
        assert!(!outbound.outputs[0].script_key_local);

        next_complete(&mut events).await;

        let delivered = env.courier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0.script_key, addr.script_key);
        assert_eq!(delivered[0].0.amount, 5_000);

        assert!(env.export_log.is_confirmed(outbound.anchor_txid()));
        // No change, no passives: nothing to watch for reorgs.
        assert!(env.watcher.watched().is_empty());

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_split_with_change() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([2; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x11);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let addr = courier_addr(asset_id, 1_200, 0x41);
        let parcel = Parcel::Address(AddressParcel::new(vec![addr.clone()], None));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        assert_eq!(outbound.outputs.len(), 2);
        let change = outbound
            .outputs
            .iter()
            .find(|o| o.script_key_local)
            .expect("change output");
        assert_eq!(change.amount, 3_800);
        assert!(change.script_key.raw_key.is_some());

        next_complete(&mut events).await;

        // Only the remote proof is delivered; the change proof is watched
        // for reorgs instead.
        let delivered = env.courier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0.script_key, addr.script_key);

        let watched = env.watcher.watched();
        assert_eq!(watched.len(), 1);
        assert_eq!(watched[0].script_key, change.script_key.pub_key);

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_merge_two_inputs() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([3; 32]);
        let first = env.add_asset_utxo(asset_id, 3_000, 0x12);
        let second = env.add_asset_utxo(asset_id, 2_000, 0x13);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let addr = courier_addr(asset_id, 5_000, 0x42);
        let parcel = Parcel::Address(AddressParcel::new(vec![addr], None));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        assert_eq!(outbound.inputs.len(), 2);
        assert_eq!(outbound.inputs[0].prev_id, first);
        assert_eq!(outbound.inputs[1].prev_id, second);

        next_complete(&mut events).await;

        // The trunk is the first input's lineage; the second lineage rides
        // in the suffix.
        let delivered = env.courier.delivered();
        assert_eq!(delivered.len(), 1);
        let file = ProofFile::decode(&delivered[0].1.blob).unwrap();
        let last = file.last_proof().unwrap();
        assert_eq!(last.additional_inputs.len(), 1);
        assert_eq!(
            last.additional_inputs[0].last_proof().unwrap().script_key,
            second.script_key
        );

        // Sealed proof files re-encode byte-identically.
        assert_eq!(file.encode().unwrap(), delivered[0].1.blob);

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_passive_co_residence() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([4; 32]);
        let passive_id = AssetId::new([5; 32]);
        let (_, passive_prev) =
            env.add_commitment_with(asset_id, 5_000, 0x14, Some((passive_id, 777)));
        let passive_prev = passive_prev.unwrap();
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let addr = courier_addr(asset_id, 5_000, 0x43);
        let parcel = Parcel::Address(AddressParcel::new(vec![addr], None));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        assert_eq!(outbound.passive_assets.len(), 1);
        let passive_out = &outbound.passive_assets[0].outputs[0];
        assert_eq!(passive_out.asset.asset_id, passive_id);
        assert_eq!(passive_out.script_key.pub_key, passive_prev.script_key);

        next_complete(&mut events).await;

        // The passive proof is archived and watched, but never delivered.
        let confirmation = env
            .export_log
            .confirmation(outbound.anchor_txid())
            .expect("confirmation record");
        let passive_proofs = confirmation
            .passive_asset_proof_files
            .get(&passive_id)
            .expect("passive proofs in confirmation");
        assert_eq!(passive_proofs.len(), 1);

        assert_eq!(env.courier.delivered().len(), 1);
        assert!(env
            .watcher
            .watched()
            .iter()
            .any(|p| p.asset_id == passive_id));

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_resume_after_crash_between_store_and_broadcast() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([6; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x15);

        // First run: the checkpoint is written, then broadcast fails with a
        // recoverable error.
        env.chain_bridge
            .set_publish_error(Some(PorterError::Publish("connection reset".into())));
        let porter = env.started_porter().await;

        let addr = courier_addr(asset_id, 1_200, 0x44);
        let parcel = Parcel::Address(AddressParcel::new(vec![addr], None));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::Publish(_)));

        let pending = env.export_log.pending();
        assert_eq!(pending.len(), 1);
        let stored_txid = pending[0].anchor_txid();

        // Post-checkpoint failures never release the lease.
        assert!(env.wallet.unlocked_inputs().is_empty());
        porter.stop().await;

        // Second run: the stored parcel is re-queued on start, the same
        // txid is broadcast and the transfer completes.
        env.chain_bridge.set_publish_error(None);
        env.chain_bridge.set_auto_confirm(true);
        let resumed = ChainPorter::new(env.config());
        let mut events = resumed.register_subscriber();
        resumed.start().await.unwrap();

        next_complete(&mut events).await;

        let published = env.chain_bridge.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].compute_txid(), stored_txid);
        assert!(env.export_log.is_confirmed(stored_txid));
        assert_eq!(env.courier.delivered().len(), 1);

        resumed.stop().await;
    }

    #[tokio::test]
    async fn test_double_spend_on_broadcast() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([7; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x16);
        env.chain_bridge
            .set_publish_error(Some(PorterError::DoubleSpend("output already spent".into())));

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let addr = courier_addr(asset_id, 5_000, 0x45);
        let parcel = Parcel::Address(AddressParcel::new(vec![addr], None));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::DoubleSpend(_)));

        // The fee input is released and no confirmation wait ever starts.
        assert_eq!(env.wallet.unlocked_inputs().len(), 1);
        assert!(env.chain_bridge.registrations().is_empty());

        let error_event = next_error(&mut events).await;
        assert_eq!(error_event.state, SendState::Broadcast);

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_pre_signed_parcel() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([8; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x17);
        env.chain_bridge.set_auto_confirm(true);

        // Fund and sign outside the porter, as an external coordinator
        // would.
        let addr = courier_addr(asset_id, 5_000, 0x46);
        let fund_result = env.asset_wallet.fund_address_send(&[addr]).await.unwrap();
        let mut packet = fund_result.packet;
        env.asset_wallet
            .sign_virtual_packet(&mut packet)
            .await
            .unwrap();

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let parcel = Parcel::PreSigned(crate::parcel::PreSignedParcel::new(
            vec![packet],
            fund_result.input_commitments,
        ));
        let outbound = porter.request_shipment(parcel).await.unwrap();
        assert_eq!(outbound.outputs.len(), 1);

        next_complete(&mut events).await;
        assert_eq!(env.courier.delivered().len(), 1);

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_interactive_send_skips_delivery() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([9; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x18);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let parcel = Parcel::Address(AddressParcel::new(
            vec![interactive_addr(asset_id, 5_000, 0x47)],
            None,
        ));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        next_complete(&mut events).await;
        assert!(env.courier.delivered().is_empty());
        assert_eq!(env.courier.opened_count(), 0);
        assert!(env.export_log.is_confirmed(outbound.anchor_txid()));

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_state_monotonicity() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([10; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x19);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x48)],
            None,
        ));
        porter.request_shipment(parcel).await.unwrap();

        let mut states = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.events.recv().await {
                    Some(PorterEvent::Send(ev)) => {
                        assert!(!ev.is_error());
                        states.push(ev.state);
                        if ev.state == SendState::Complete {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("transfer did not complete in time");

        for pair in states.windows(2) {
            assert!(pair[0] < pair[1], "state went backwards: {pair:?}");
        }
        assert_eq!(states.first(), Some(&SendState::VirtualCommitmentSelect));
        assert_eq!(states.last(), Some(&SendState::Complete));

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_parcel_rejected_at_ingress() {
        let env = TestEnv::new();
        let porter = env.started_porter().await;

        let parcel = Parcel::Address(AddressParcel::new(vec![], None));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::InvalidParcel(_)));

        assert!(env.export_log.pending().is_empty());
        assert!(env.chain_bridge.published().is_empty());

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_coin_selection_failure() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([11; 32]);
        env.add_asset_utxo(asset_id, 1_000, 0x1a);

        let porter = env.started_porter().await;
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x49)],
            None,
        ));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::CoinSelection(_)));

        // Nothing was locked and nothing was persisted.
        assert!(env.export_log.pending().is_empty());
        assert!(env.wallet.unlocked_inputs().is_empty());

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_signing_failure_surfaces_before_checkpoint() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([12; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x1b);
        env.asset_wallet.set_fail_signing(true);

        let porter = env.started_porter().await;
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x4a)],
            None,
        ));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::Signing(_)));
        assert!(env.export_log.pending().is_empty());

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_unbalanced_transfer_unlocks_inputs() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([13; 32]);
        let passive_id = AssetId::new([14; 32]);
        env.add_commitment_with(asset_id, 5_000, 0x1c, Some((passive_id, 42)));
        // The co-resident is silently dropped, leaving it unaccounted for.
        env.asset_wallet.set_omit_passive(true);

        let porter = env.started_porter().await;
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x4b)],
            None,
        ));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::UnbalancedTransfer(_)));

        // The anchor had locked a fee input; the failure released it, and
        // no checkpoint was written.
        assert_eq!(env.wallet.unlocked_inputs().len(), 1);
        assert!(env.export_log.pending().is_empty());

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_manual_fee_rate_bypasses_estimator() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([15; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x1d);
        env.add_asset_utxo(asset_id, 5_000, 0x1e);
        env.chain_bridge.set_fail_fee(true);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        // Without an override the estimator failure surfaces.
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x4c)],
            None,
        ));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::FeeEstimation(_)));

        // With a manual rate the estimator is never consulted. The first
        // parcel's error event is still on the bus, so wait for completion
        // without treating it as a failure of this send.
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x4d)],
            Some(FeeRate::from_sat_per_kwu(500)),
        ));
        porter.request_shipment(parcel).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.events.recv().await {
                    Some(PorterEvent::Send(ev))
                        if ev.state == SendState::Complete && !ev.is_error() =>
                    {
                        break;
                    }
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("transfer did not complete in time");

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_courier_backoff_is_swallowed() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([16; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x1f);
        env.chain_bridge.set_auto_confirm(true);
        env.courier
            .set_failure(Some(CourierError::Backoff("mailbox busy".into())));

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x4e)],
            None,
        ));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        // The courier retries externally; the parcel still completes.
        next_complete(&mut events).await;
        assert!(env.courier.delivered().is_empty());
        assert!(env.export_log.is_confirmed(outbound.anchor_txid()));

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_courier_fatal_failure_emits_error() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([17; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x20);
        env.chain_bridge.set_auto_confirm(true);
        env.courier
            .set_failure(Some(CourierError::Fatal("recipient gone".into())));

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();

        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x4f)],
            None,
        ));
        let outbound = porter.request_shipment(parcel).await.unwrap();

        // Completion is not rolled back, but the failure is surfaced with
        // the delivering state annotated and the parcel stays unconfirmed.
        let error_event = next_error(&mut events).await;
        assert_eq!(error_event.state, SendState::TransferProofs);
        assert!(!env.export_log.is_confirmed(outbound.anchor_txid()));

        porter.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_confirmation() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([18; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x21);

        let porter = env.started_porter().await;
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x50)],
            None,
        ));
        // Broadcast succeeds; no confirmation is ever delivered, so the
        // runner blocks in the confirmation wait.
        let outbound = porter.request_shipment(parcel).await.unwrap();

        // Stop must return promptly and leave the checkpoint intact for
        // the next start.
        tokio::time::timeout(Duration::from_secs(5), porter.stop())
            .await
            .expect("stop did not return");

        assert!(!env.export_log.is_confirmed(outbound.anchor_txid()));
        assert_eq!(env.export_log.pending().len(), 1);
        assert!(env.wallet.unlocked_inputs().is_empty());
    }

    #[tokio::test]
    async fn test_request_after_stop() {
        let env = TestEnv::new();
        let porter = env.started_porter().await;
        porter.stop().await;

        let asset_id = AssetId::new([19; 32]);
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 100, 0x51)],
            None,
        ));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let env = TestEnv::new();
        let porter = env.started_porter().await;
        porter.start().await.unwrap();
        porter.start().await.unwrap();
        porter.stop().await;
    }

    #[tokio::test]
    async fn test_subscriber_management() {
        let env = TestEnv::new();
        let porter = ChainPorter::new(env.config());

        let subscription = porter.register_subscriber();
        porter.remove_subscriber(subscription.id).unwrap();
        assert!(porter.remove_subscriber(subscription.id).is_err());
    }

    #[tokio::test]
    async fn test_query_parcels_passthrough() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([20; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x22);
        env.chain_bridge.set_auto_confirm(true);

        let porter = env.started_porter().await;
        let mut events = porter.register_subscriber();
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x52)],
            None,
        ));
        let outbound = porter.request_shipment(parcel).await.unwrap();
        next_complete(&mut events).await;

        let txid = outbound.anchor_txid();
        assert_eq!(porter.query_parcels(None, false).await.unwrap().len(), 1);
        assert!(porter.query_parcels(None, true).await.unwrap().is_empty());
        assert_eq!(
            porter.query_parcels(Some(txid), false).await.unwrap().len(),
            1
        );
        let other = Txid::from_byte_array([0xff; 32]);
        assert!(porter
            .query_parcels(Some(other), false)
            .await
            .unwrap()
            .is_empty());

        porter.stop().await;
    }

    fn empty_outbound() -> OutboundParcel {
        OutboundParcel {
            anchor_tx: Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![],
                output: vec![TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: ScriptBuf::new(),
                }],
            },
            anchor_tx_height_hint: 0,
            inputs: vec![],
            outputs: vec![],
            passive_assets: vec![],
        }
    }

    #[tokio::test]
    async fn test_wrong_parcel_variant_in_commitment_select() {
        let env = TestEnv::new();
        let porter = ChainPorter::new(env.config());

        let mut pkg = SendPackage::new(
            Parcel::Pending(PendingParcel::new(empty_outbound())),
            SendState::VirtualCommitmentSelect,
        );
        let err = porter.inner.state_step(&mut pkg).await.unwrap_err();
        assert!(matches!(err, PorterError::WrongParcelVariant(_)));
    }

    #[tokio::test]
    async fn test_passive_only_transfer_skips_active_proofs() {
        let env = TestEnv::new();
        let porter = ChainPorter::new(env.config());

        let passive_id = AssetId::new([21; 32]);
        let passive_prev = env.add_asset_utxo(passive_id, 777, 0x23);

        // Re-anchor the passive asset under a fresh anchor transaction
        // without any active transfer.
        let anchor_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: passive_prev.out_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: TxWitness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let txid = anchor_tx.compute_txid();

        let script_key = ScriptKey::new(passive_prev.script_key);
        let mut asset = Asset::new(passive_id, 777, script_key);
        asset.witnesses.push(Witness {
            prev_id: Some(passive_prev),
            tx_witness: vec![vec![0xaa; 64]],
        });
        let suffix = TransitionProof::new(
            passive_id,
            777,
            passive_prev.script_key,
            OutPoint { txid, vout: 0 },
            asset.witnesses.clone(),
        );
        let packet = VPacket::new(
            PacketVersion::V1,
            vec![VInput {
                prev_id: passive_prev,
                asset: asset.clone(),
            }],
            vec![VOutput {
                amount: 777,
                script_key,
                asset,
                anchor_output_index: 0,
                proof_suffix: Some(suffix.encode().unwrap()),
                proof_courier_addr: None,
            }],
        );

        let outbound = OutboundParcel {
            anchor_tx: anchor_tx.clone(),
            anchor_tx_height_hint: 100,
            inputs: vec![],
            outputs: vec![],
            passive_assets: vec![packet],
        };
        let conf = TxConfirmation {
            block_hash: BlockHash::all_zeros(),
            block_height: 101,
            header: test_header(),
            tx: anchor_tx,
            tx_index: 1,
        };

        let mut pkg = SendPackage::new(
            Parcel::Pending(PendingParcel::new(outbound.clone())),
            SendState::StoreProofs,
        );
        pkg.outbound = Some(outbound);
        pkg.conf_event = Some(conf);

        porter.inner.store_proofs(&mut pkg).await.unwrap();

        assert_eq!(pkg.send_state, SendState::TransferProofs);
        assert!(pkg.final_proofs.is_empty());
        assert!(env.archive.contains(&Locator {
            asset_id: passive_id,
            script_key: passive_prev.script_key,
            out_point: Some(OutPoint { txid, vout: 0 }),
        }));
        assert_eq!(env.watcher.watched().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_skip_rules() {
        let env = TestEnv::new();
        let porter = ChainPorter::new(env.config());
        let final_proofs = HashMap::new();

        let base_outpoint = OutPoint {
            txid: Txid::from_byte_array([0x60; 32]),
            vout: 0,
        };
        let output = |script_key: ScriptKey, local: bool, courier: Option<String>| {
            TransferOutput {
                script_key,
                script_key_local: local,
                amount: 100,
                anchor_outpoint: base_outpoint,
                anchor_value: 1_000,
                proof_suffix: vec![],
                proof_courier_addr: courier,
                witness_data: vec![],
            }
        };
        let courier_url = || Some("hashmail://proofs.example.com:443".to_string());

        // Local output: skipped.
        let local_key = ScriptKey::new(SerializedKey::new([0x61; 33]))
            .with_raw_key(SerializedKey::new([0x62; 33]));
        porter
            .inner
            .deliver_proof_for_output(&output(local_key, true, courier_url()), &final_proofs)
            .await
            .unwrap();

        // Tombstone: skipped.
        porter
            .inner
            .deliver_proof_for_output(
                &output(ScriptKey::new(NUMS_KEY), false, courier_url()),
                &final_proofs,
            )
            .await
            .unwrap();

        // Burn: skipped.
        let burn_prev = PrevId {
            out_point: base_outpoint,
            asset_id: AssetId::new([22; 32]),
            script_key: SerializedKey::new([0x63; 33]),
        };
        let mut burn_output = output(ScriptKey::new(burn_prev.burn_key()), false, courier_url());
        burn_output.witness_data.push(Witness {
            prev_id: Some(burn_prev),
            tx_witness: vec![],
        });
        porter
            .inner
            .deliver_proof_for_output(&burn_output, &final_proofs)
            .await
            .unwrap();

        // No courier address: skipped.
        porter
            .inner
            .deliver_proof_for_output(
                &output(ScriptKey::new(SerializedKey::new([0x64; 33])), false, None),
                &final_proofs,
            )
            .await
            .unwrap();

        assert_eq!(env.courier.opened_count(), 0);

        // A deliverable output without a matching final proof is an error.
        let err = porter
            .inner
            .deliver_proof_for_output(
                &output(
                    ScriptKey::new(SerializedKey::new([0x65; 33])),
                    false,
                    courier_url(),
                ),
                &final_proofs,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PorterError::Internal(_)));
    }

    #[tokio::test]
    async fn test_persistence_failure_unlocks_inputs() {
        let env = TestEnv::new();
        let asset_id = AssetId::new([23; 32]);
        env.add_asset_utxo(asset_id, 5_000, 0x24);
        env.export_log.set_fail_log(true);

        let porter = env.started_porter().await;
        let parcel = Parcel::Address(AddressParcel::new(
            vec![courier_addr(asset_id, 5_000, 0x53)],
            None,
        ));
        let err = porter.request_shipment(parcel).await.unwrap_err();
        assert!(matches!(err, PorterError::Persistence(_)));
        assert_eq!(env.wallet.unlocked_inputs().len(), 1);

        porter.stop().await;
    }

    #[test]
    fn test_default_wallet_lease_identifier_is_stable() {
        assert_eq!(
            default_wallet_lease_identifier(),
            default_wallet_lease_identifier()
        );
        assert_ne!(default_wallet_lease_identifier(), [0u8; 32]);
    }
}
