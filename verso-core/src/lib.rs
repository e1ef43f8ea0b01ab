//! # verso-core - Replicated document primitive for Verso
//!
//! Everything above this crate (the sync hub, the revision log, the
//! reconstructor) treats the document as an opaque value that can be
//! encoded, diffed, merged and applied. The [`Replica`] trait is that
//! contract; [`YrsReplica`] is the production implementation on top of
//! the Yrs CRDT.
//!
//! ```text
//!   delta ──► Replica::apply_update ──► update event ──► take_emitted()
//!                     │
//!                     ├── state_vector()          (what do I know?)
//!                     ├── encode_diff(sv)         (what are you missing?)
//!                     └── encode_state_as_update  (everything)
//! ```
//!
//! Merging is order-independent and idempotent: applying `merge([a, b])`
//! equals applying `a` then `b`, `b` then `a`, or `a` twice then `b`.

pub mod replica;

pub use replica::{DocError, Replica, YrsReplica};
