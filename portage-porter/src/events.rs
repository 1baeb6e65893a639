//! Events published to porter subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use portage_core::VPacket;
use portage_proof::CourierEvent;

use crate::error::PorterError;
use crate::log::OutboundParcel;
use crate::package::PackageSnapshot;
use crate::state::SendState;
use crate::wallet::AnchorTransaction;

/// Events observable through a porter subscription.
#[derive(Debug, Clone)]
pub enum PorterEvent {
    /// A pipeline state was executed (or failed).
    Send(AssetSendEvent),
    /// A courier reported progress on a proof delivery.
    Courier(CourierEvent),
}

/// Published after every executed state, and on errors with the failing
/// state annotated.
///
/// The packet, anchor and transfer contents are deep copies, so subscribers
/// can read them without racing the runner.
#[derive(Debug, Clone)]
pub struct AssetSendEvent {
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// The state that was executed, or was executing when the error hit.
    pub state: SendState,
    /// The error that ended the transfer, if any.
    pub error: Option<Arc<PorterError>>,
    /// The active packets of the transfer.
    pub virtual_packets: Vec<VPacket>,
    /// The passive packets of the transfer.
    pub passive_packets: Vec<VPacket>,
    /// The anchor transaction, once built.
    pub anchor_tx: Option<AnchorTransaction>,
    /// The persisted projection, once stored.
    pub transfer: Option<OutboundParcel>,
}

impl AssetSendEvent {
    /// Event for a successfully executed state.
    pub(crate) fn from_snapshot(executed: SendState, snapshot: &PackageSnapshot) -> Self {
        Self {
            timestamp: Utc::now(),
            state: executed,
            error: None,
            virtual_packets: snapshot.virtual_packets.clone(),
            passive_packets: snapshot.passive_assets.clone(),
            anchor_tx: snapshot.anchor_tx.clone(),
            transfer: snapshot.outbound.clone(),
        }
    }

    /// Event for a failed state execution.
    pub(crate) fn from_error(
        error: Arc<PorterError>,
        executed: SendState,
        snapshot: &PackageSnapshot,
    ) -> Self {
        let mut event = Self::from_snapshot(executed, snapshot);
        event.error = Some(error);
        event
    }

    /// Whether this event reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A live subscription to porter events.
///
/// Registration covers future events only. Dropping the subscription (or
/// removing it by ID) ends delivery; the inbox is bounded, so a subscriber
/// that stops reading eventually stalls publication.
#[derive(Debug)]
pub struct EventSubscription {
    /// Identifier used to remove the subscription.
    pub id: u64,
    /// The event inbox.
    pub events: mpsc::Receiver<PorterEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_event_annotates_state() {
        let snapshot = PackageSnapshot {
            virtual_packets: vec![],
            passive_assets: vec![],
            anchor_tx: None,
            outbound: None,
            conf_event: None,
            final_proofs: Default::default(),
        };
        let event = AssetSendEvent::from_error(
            Arc::new(PorterError::Publish("boom".into())),
            SendState::Broadcast,
            &snapshot,
        );
        assert!(event.is_error());
        assert_eq!(event.state, SendState::Broadcast);
    }
}
