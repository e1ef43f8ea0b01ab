//! The document contract consumed by the hub and the history engine.
//!
//! The CRDT itself is not implemented here. `YrsReplica` wraps a
//! `yrs::Doc` and turns its update-event subscription into a pull-style
//! queue so the owner can fan out emitted updates inside its own
//! critical section.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

/// Errors raised by the document primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
    #[error("Failed to observe document updates: {0}")]
    Observe(String),
}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Decode(e.to_string())
    }
}

/// A replicated document instance.
///
/// Implementations must guarantee that `apply_update` is commutative and
/// idempotent, and that `merge_updates` produces a single delta equivalent
/// to applying its inputs in any order.
pub trait Replica: Send + Sync + Sized + 'static {
    /// Create a new, empty document.
    fn empty() -> Result<Self, DocError>;

    /// Encoded state vector (causal summary of everything seen so far).
    fn state_vector(&self) -> Vec<u8>;

    /// Whole document state encoded as a single delta.
    fn encode_state_as_update(&self) -> Vec<u8>;

    /// Delta containing everything a peer with `remote_state_vector` lacks.
    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError>;

    /// Integrate a delta produced by any replica of the same document.
    fn apply_update(&self, delta: &[u8]) -> Result<(), DocError>;

    /// Drain the update events emitted since the previous call.
    ///
    /// Re-applying an already known delta emits nothing.
    fn take_emitted(&self) -> Vec<Vec<u8>>;

    /// Merge several deltas into one. Order of `updates` is irrelevant.
    fn merge_updates<B: AsRef<[u8]>>(updates: &[B]) -> Result<Vec<u8>, DocError>;

    /// Build a fresh replica holding exactly `delta`.
    fn from_update(delta: &[u8]) -> Result<Self, DocError> {
        let replica = Self::empty()?;
        replica.apply_update(delta)?;
        Ok(replica)
    }
}

/// `Replica` backed by a Yrs document.
pub struct YrsReplica {
    doc: Doc,
    emitted: Arc<Mutex<Vec<Vec<u8>>>>,
    _subscription: Subscription,
}

impl YrsReplica {
    /// The underlying Yrs document, for editing rich-text content.
    ///
    /// Local transactions committed here show up in `take_emitted` like
    /// remote ones do.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Number of queued update events not yet drained.
    pub fn pending_events(&self) -> usize {
        self.emitted.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Replica for YrsReplica {
    fn empty() -> Result<Self, DocError> {
        let doc = Doc::new();
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let subscription = doc
            .observe_update_v1(move |_txn, event| {
                if let Ok(mut queue) = sink.lock() {
                    queue.push(event.update.clone());
                }
            })
            .map_err(|e| DocError::Observe(e.to_string()))?;

        Ok(Self {
            doc,
            emitted,
            _subscription: subscription,
        })
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let remote = StateVector::decode_v1(remote_state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    fn apply_update(&self, delta: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(delta)?;
        // Scope the transaction so the update event fires before we return.
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocError::Apply(e.to_string()))?;
        }
        Ok(())
    }

    fn take_emitted(&self) -> Vec<Vec<u8>> {
        match self.emitted.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => {
                log::error!("Update event queue poisoned; dropping emitted updates");
                Vec::new()
            }
        }
    }

    fn merge_updates<B: AsRef<[u8]>>(updates: &[B]) -> Result<Vec<u8>, DocError> {
        let decoded = updates
            .iter()
            .map(|u| Update::decode_v1(u.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Update::merge_updates(decoded).encode_v1())
    }
}
