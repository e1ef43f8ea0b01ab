//! # verso-history - Revision log and point-in-time previews
//!
//! Local edits stream into an [`UpdateLog`], which coalesces bursts of
//! deltas into numbered revisions. [`build_doc_at_revision`] replays a
//! prefix of that log into a fresh replica for read-only preview.
//!
//! ```text
//!  delta ─► append ─► pending ──(debounce / max-wait)──► commit
//!                                                          │
//!                                  UpdateRecord { revision, timestamp, delta }
//!                                                          │
//!                         build_doc_at_revision(k) ◄───────┘
//! ```

pub mod update_log;
pub mod reconstruct;

use thiserror::Error;
use verso_core::DocError;

pub use update_log::{LogConfig, LogEvent, Subscription, UpdateLog, UpdateRecord};
pub use reconstruct::{build_doc_at_revision, build_from_entries, PreviewReplica};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("document error: {0}")]
    Document(#[from] DocError),

    #[error("failed to merge {dropped} pending deltas: {source}")]
    Merge {
        dropped: usize,
        #[source]
        source: DocError,
    },
}
