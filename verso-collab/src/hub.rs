//! Room registry and connection lifecycle.
//!
//! ```text
//!              SyncHub
//!   RwLock<HashMap<name, Arc<Mutex<Room>>>>
//!        │                     │
//!   add/remove (write)    handle_frame (read, clone Arc, release)
//!        │                     │
//!        └──────► Room mutex ◄─┘   merge + fan-out under one lock
//! ```
//!
//! Lock order is always registry, then room. Rooms are created lazily by
//! the first connection and destroyed with the last one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use verso_core::{DocError, Replica, YrsReplica};

use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use crate::protocol::{ClientId, ProtocolError};
use crate::room::{Delivery, Room};

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Deliver document updates back to the connection that sent them
    pub echo_to_sender: bool,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
    /// Presence entries not renewed within this window are dropped
    #[serde(with = "duration_secs")]
    pub awareness_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            echo_to_sender: true,
            event_capacity: 64,
            awareness_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Lifecycle notifications published by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    RoomCreated { room: String },
    RoomClosed { room: String },
    ConnectionAdded { room: String, connection: ConnectionId },
    ConnectionRemoved { room: String, connection: ConnectionId },
    /// A frame was rejected; the connection stays open.
    RoomError { room: String, connection: ConnectionId, error: String },
}

/// Hub-level errors.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("document error: {0}")]
    Document(#[from] DocError),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("connection {1} is not registered in room {0}")]
    UnknownConnection(String, ConnectionId),
}

/// Counters since hub creation.
#[derive(Debug, Default)]
pub struct HubStats {
    active_rooms: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    pub active_rooms: u64,
    pub active_connections: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    /// Frames rejected by decode or apply
    pub decode_errors: u64,
}

impl HubStats {
    pub fn snapshot(&self) -> HubStatsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        HubStatsSnapshot {
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            active_connections: opened.saturating_sub(closed),
            connections_opened: opened,
            connections_closed: closed,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

type RoomMap<D> = HashMap<String, Arc<Mutex<Room<D>>>>;

/// Routes frames to rooms and manages membership.
pub struct SyncHub<D: Replica = YrsReplica> {
    config: HubConfig,
    rooms: RwLock<RoomMap<D>>,
    events: broadcast::Sender<HubEvent>,
    stats: HubStats,
}

impl<D: Replica> SyncHub<D> {
    pub fn new(config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            events,
            stats: HubStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.stats.snapshot()
    }

    /// Receive lifecycle events published after this call.
    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// A fresh handle sized by the hub's outbound capacity.
    pub fn new_connection(&self) -> (ConnectionHandle, tokio::sync::mpsc::Receiver<Outbound>) {
        ConnectionHandle::channel(self.config.outbound_capacity)
    }

    /// Join `conn` to `room`, creating the room if needed. The connection
    /// immediately receives SyncStep1 and any live presence.
    pub async fn add_connection(&self, room: &str, conn: ConnectionHandle) -> Result<(), HubError> {
        let id = conn.id();
        let delivery = {
            let mut rooms = self.rooms.write().await;
            let entry = match rooms.get(room) {
                Some(existing) => existing.clone(),
                None => {
                    let created = Arc::new(Mutex::new(Room::new(room)?));
                    rooms.insert(room.to_string(), created.clone());
                    self.stats.active_rooms.fetch_add(1, Ordering::Relaxed);
                    log::info!("Room {room} created");
                    self.emit(HubEvent::RoomCreated { room: room.to_string() });
                    created
                }
            };
            let mut guard = entry.lock().await;
            let delivery = guard.attach(conn);
            log::info!(
                "Connection {id} joined room {room} ({} connected)",
                guard.connection_count()
            );
            delivery
        };

        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.emit(HubEvent::ConnectionAdded { room: room.to_string(), connection: id });
        self.settle(room, delivery).await;
        Ok(())
    }

    /// Remove a connection. Presence it controlled is tombstoned and
    /// announced, its handle is closed, and an emptied room is destroyed.
    /// Removing an unknown connection is a no-op.
    pub async fn remove_connection(&self, room: &str, id: ConnectionId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            if let Some(failed) = self.detach(room, id).await {
                self.stats.send_failures.fetch_add(failed.len() as u64, Ordering::Relaxed);
                pending.extend(failed);
            }
        }
    }

    async fn detach(&self, room: &str, id: ConnectionId) -> Option<Vec<ConnectionId>> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.get(room)?.clone();
        let mut guard = entry.lock().await;

        let (handle, delivery) = guard.detach(id);
        let handle = handle?;
        handle.close();
        let now_empty = guard.is_empty();
        drop(guard);

        if now_empty {
            rooms.remove(room);
            self.stats.active_rooms.fetch_sub(1, Ordering::Relaxed);
        }
        drop(rooms);

        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.stats.frames_sent.fetch_add(delivery.sent, Ordering::Relaxed);
        log::info!("Connection {id} left room {room}");
        self.emit(HubEvent::ConnectionRemoved { room: room.to_string(), connection: id });
        if now_empty {
            log::info!("Room {room} closed");
            self.emit(HubEvent::RoomClosed { room: room.to_string() });
        }
        Some(delivery.failed)
    }

    /// Process one binary frame from a registered connection.
    ///
    /// A frame that fails to decode or apply is logged and reported; the
    /// room and the connection are left untouched.
    pub async fn handle_frame(&self, room: &str, id: ConnectionId, bytes: &[u8]) -> Result<(), HubError> {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let entry = self
            .room(room)
            .await
            .ok_or_else(|| HubError::RoomNotFound(room.to_string()))?;

        let result = {
            let mut guard = entry.lock().await;
            if !guard.has_connection(id) {
                return Err(HubError::UnknownConnection(room.to_string(), id));
            }
            guard.handle_frame(id, bytes, self.config.echo_to_sender)
        };

        match result {
            Ok(delivery) => {
                self.settle(room, delivery).await;
                Ok(())
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected frame from {id} in room {room}: {e}");
                self.emit(HubEvent::RoomError {
                    room: room.to_string(),
                    connection: id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drop presence not renewed within the configured timeout, in every
    /// room. Returns the number of rooms that changed.
    pub async fn expire_awareness(&self) -> usize {
        let entries: Vec<(String, Arc<Mutex<Room<D>>>)> = {
            let rooms = self.rooms.read().await;
            rooms.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut changed = 0;
        for (name, entry) in entries {
            let expired = entry.lock().await.expire_awareness(self.config.awareness_timeout);
            if let Some(delivery) = expired {
                changed += 1;
                self.settle(&name, delivery).await;
            }
        }
        changed
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connection_count(&self, room: &str) -> usize {
        match self.room(room).await {
            Some(entry) => entry.lock().await.connection_count(),
            None => 0,
        }
    }

    pub async fn has_connection(&self, room: &str, id: ConnectionId) -> bool {
        match self.room(room).await {
            Some(entry) => entry.lock().await.has_connection(id),
            None => false,
        }
    }

    /// Live presence states of a room.
    pub async fn awareness_states(&self, room: &str) -> BTreeMap<ClientId, Value> {
        match self.room(room).await {
            Some(entry) => entry.lock().await.awareness().current_states(),
            None => BTreeMap::new(),
        }
    }

    /// Run `f` against a room while holding its lock.
    pub async fn with_room<R>(&self, room: &str, f: impl FnOnce(&Room<D>) -> R) -> Option<R> {
        let entry = self.room(room).await?;
        let guard = entry.lock().await;
        Some(f(&guard))
    }

    async fn room(&self, name: &str) -> Option<Arc<Mutex<Room<D>>>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Count delivered frames and evict connections that refused one.
    async fn settle(&self, room: &str, delivery: Delivery) {
        self.stats.frames_sent.fetch_add(delivery.sent, Ordering::Relaxed);
        for id in delivery.failed {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("Send to {id} failed, dropping it from room {room}");
            self.remove_connection(room, id).await;
        }
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
