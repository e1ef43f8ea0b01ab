//! Point-in-time document previews.
//!
//! A preview is built from scratch: merge the deltas of every revision up
//! to the target and apply the result to an empty replica. The live
//! document is never touched, and the same inputs always give the same
//! state.

use std::ops::Deref;

use verso_core::Replica;

use crate::update_log::{UpdateLog, UpdateRecord};
use crate::HistoryError;

/// Read-only replica reflecting the document as of `revision`.
pub struct PreviewReplica<D> {
    revision: u64,
    replica: D,
}

impl<D> PreviewReplica<D> {
    /// The revision actually replayed, after clamping.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn into_inner(self) -> D {
        self.replica
    }
}

impl<D> Deref for PreviewReplica<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.replica
    }
}

/// Replay `entries` up to `target`. Zero gives an empty replica; targets
/// past the newest record clamp to it.
pub fn build_from_entries<D: Replica>(
    target: u64,
    entries: &[UpdateRecord],
) -> Result<PreviewReplica<D>, HistoryError> {
    let replica = D::empty()?;
    let latest = entries.last().map_or(0, |r| r.revision);
    let revision = target.min(latest);

    let deltas: Vec<&[u8]> = entries
        .iter()
        .filter(|r| r.revision <= revision)
        .map(|r| r.delta.as_slice())
        .collect();

    if !deltas.is_empty() {
        let merged = D::merge_updates(&deltas)?;
        replica.apply_update(&merged)?;
    }
    // Nobody relays a preview's changes.
    replica.take_emitted();

    Ok(PreviewReplica { revision, replica })
}

/// Reconstruct the document as it was at `target` in `log`.
pub fn build_doc_at_revision<D: Replica>(
    target: u64,
    log: &UpdateLog<D>,
) -> Result<PreviewReplica<D>, HistoryError> {
    build_from_entries(target, &log.entries_up_to(target))
}
