//! The reorg watcher interface.
//!
//! Proofs are created after a single confirmation. If the anchor transaction
//! is re-organized out of the chain and re-confirmed in a different block,
//! the watcher re-derives the affected proofs and patches them in the
//! archive through the update callback.

use std::sync::Arc;

use async_trait::async_trait;

use crate::archive::AnnotatedProof;
use crate::error::{ProofError, Result};
use crate::transition::TransitionProof;

/// Callback invoked with a re-derived proof after a reorg.
pub type ProofUpdateCallback =
    Arc<dyn Fn(AnnotatedProof) -> std::result::Result<(), ProofError> + Send + Sync>;

/// Watches anchored proofs for reorg eviction of their anchor transaction.
#[async_trait]
pub trait ReorgWatcher: Send + Sync {
    /// Start watching the given proofs, invoking `on_update` with a patched
    /// proof whenever a reorg forces a re-derivation.
    async fn watch_proofs(
        &self,
        proofs: Vec<TransitionProof>,
        on_update: ProofUpdateCallback,
    ) -> Result<()>;

    /// The standard callback: replace the stored proof in the archive.
    fn default_update_callback(&self) -> ProofUpdateCallback;
}
