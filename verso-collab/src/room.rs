//! One shared document: replica + connections + presence.
//!
//! A `Room` is plain data with synchronous methods. The hub wraps each
//! room in its own mutex and holds it across merge and fan-out, so the
//! frames of one room are applied and broadcast strictly in arrival
//! order while different rooms proceed in parallel.
//!
//! Sends never block: every connection has a bounded outbound queue and
//! a rejected frame marks that connection as failed. The caller removes
//! failed connections after releasing the room.

use std::collections::HashMap;
use std::sync::Arc;

use verso_core::{Replica, YrsReplica};

use crate::awareness::AwarenessTracker;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::hub::HubError;
use crate::protocol::{Frame, SyncMessage};

/// Outcome of a fan-out: how many frames were queued and which
/// connections refused them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sent: u64,
    pub failed: Vec<ConnectionId>,
}

impl Delivery {
    fn record(&mut self, id: ConnectionId, ok: bool) {
        if ok {
            self.sent += 1;
        } else if !self.failed.contains(&id) {
            self.failed.push(id);
        }
    }

    fn merge(&mut self, other: Delivery) {
        self.sent += other.sent;
        for id in other.failed {
            if !self.failed.contains(&id) {
                self.failed.push(id);
            }
        }
    }
}

/// A shared document room.
pub struct Room<D: Replica = YrsReplica> {
    name: String,
    doc: D,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    awareness: AwarenessTracker,
}

impl<D: Replica> Room<D> {
    pub fn new(name: impl Into<String>) -> Result<Self, HubError> {
        Ok(Self {
            name: name.into(),
            doc: D::empty()?,
            connections: HashMap::new(),
            awareness: AwarenessTracker::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The room's authoritative replica.
    pub fn doc(&self) -> &D {
        &self.doc
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn has_connection(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Register a connection and bootstrap it: a SyncStep1 with our state
    /// vector, then (if anyone is present) all live awareness states.
    pub fn attach(&mut self, conn: ConnectionHandle) -> Delivery {
        let id = conn.id();
        self.connections.insert(id, conn);

        let mut delivery = Delivery::default();
        let step1 = Frame::sync_step1(self.doc.state_vector());
        delivery.record(id, self.send_to(id, Arc::new(step1.encode())));

        if let Some(payload) = self.awareness.encode_all() {
            let frame = Frame::awareness(payload);
            delivery.record(id, self.send_to(id, Arc::new(frame.encode())));
        }
        delivery
    }

    /// Unregister a connection, tombstone the presence it controlled and
    /// tell everyone left. Returns the removed handle.
    pub fn detach(&mut self, id: ConnectionId) -> (Option<ConnectionHandle>, Delivery) {
        let Some(handle) = self.connections.remove(&id) else {
            return (None, Delivery::default());
        };

        let change = self.awareness.remove_controlled_by(id);
        let delivery = if change.is_empty() || self.connections.is_empty() {
            Delivery::default()
        } else {
            log::trace!(
                "Room {}: removing {} awareness entries of {id}",
                self.name,
                change.removed.len()
            );
            let frame = Frame::awareness(self.awareness.encode_update(&change.changed()));
            self.broadcast(Arc::new(frame.encode()), None)
        };
        (Some(handle), delivery)
    }

    /// Process one inbound frame from `source`.
    ///
    /// With `echo_to_sender` the document update produced by the frame is
    /// also delivered back to `source`; re-applying it there is a no-op.
    pub fn handle_frame(
        &mut self,
        source: ConnectionId,
        bytes: &[u8],
        echo_to_sender: bool,
    ) -> Result<Delivery, HubError> {
        let frame = Frame::decode(bytes)?;
        let mut delivery = Delivery::default();

        match frame {
            Frame::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.doc.encode_diff(&state_vector)?;
                if !diff.is_empty() {
                    let reply = Frame::sync_step2(diff);
                    delivery.record(source, self.send_to(source, Arc::new(reply.encode())));
                }
            }
            Frame::Sync(SyncMessage::SyncStep2(delta)) | Frame::Sync(SyncMessage::Update(delta)) => {
                if !delta.is_empty() {
                    self.doc.apply_update(&delta)?;
                }
            }
            Frame::Awareness(payload) => {
                let change = self.awareness.apply_update(&payload, source)?;
                if !change.is_empty() {
                    log::trace!(
                        "Room {}: awareness +{} ~{} -{}",
                        self.name,
                        change.added.len(),
                        change.updated.len(),
                        change.removed.len()
                    );
                    let frame = Frame::awareness(self.awareness.encode_update(&change.changed()));
                    delivery.merge(self.broadcast(Arc::new(frame.encode()), None));
                }
            }
        }

        let exclude = if echo_to_sender { None } else { Some(source) };
        delivery.merge(self.flush_updates(exclude));
        Ok(delivery)
    }

    /// Broadcast every update the document emitted since the last flush.
    pub fn flush_updates(&mut self, exclude: Option<ConnectionId>) -> Delivery {
        let mut delivery = Delivery::default();
        for update in self.doc.take_emitted() {
            if update.is_empty() {
                continue;
            }
            let frame = Arc::new(Frame::update(update).encode());
            delivery.merge(self.broadcast(frame, exclude));
        }
        delivery
    }

    /// Tombstone presence entries that have not been renewed in time.
    /// `None` when nothing expired.
    pub fn expire_awareness(&mut self, timeout: std::time::Duration) -> Option<Delivery> {
        let change = self.awareness.remove_outdated(timeout);
        if change.is_empty() {
            return None;
        }
        let frame = Frame::awareness(self.awareness.encode_update(&change.changed()));
        Some(self.broadcast(Arc::new(frame.encode()), None))
    }

    /// Queue `frame` on every connection except `exclude`.
    pub fn broadcast(&self, frame: Arc<Vec<u8>>, exclude: Option<ConnectionId>) -> Delivery {
        let mut delivery = Delivery::default();
        for (id, conn) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            delivery.record(*id, conn.send_frame(frame.clone()).is_ok());
        }
        delivery
    }

    fn send_to(&self, id: ConnectionId, frame: Arc<Vec<u8>>) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|conn| conn.send_frame(frame).is_ok())
    }
}
