//! WebSocket sync client for a hub room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - The state-vector handshake in both directions
//! - Local edits relayed as update frames, remote ones applied
//! - Hooks observing local deltas or every delta the replica emits
//! - Presence publishing and a view of the peers in the room
//!
//! Edits made while disconnected are not queued. The next handshake
//! sends whatever the server is missing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use verso_core::{DocError, Replica, YrsReplica};

use crate::awareness::{AwarenessChange, AwarenessTracker};
use crate::protocol::{AwarenessRecord, AwarenessUpdate, ClientId, Frame, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The server answered our state vector
    Synced,
    /// A remote update was applied to the local replica
    RemoteUpdate(Vec<u8>),
    /// Presence of other clients changed
    Awareness(AwarenessChange),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("document error: {0}")]
    Document(#[from] DocError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected")]
    NotConnected,
}

/// Callback receiving replica deltas, see [`SyncClient::on_local_update`]
/// and [`SyncClient::on_update`].
pub type UpdateSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Shared between the client handle and its reader task.
struct Shared<D> {
    replica: D,
    /// Serializes "mutate, then drain emitted updates" so remote applies
    /// never swallow a local delta.
    gate: std::sync::Mutex<()>,
    peers: Mutex<AwarenessTracker>,
    state: RwLock<ConnectionState>,
}

impl<D: Replica> Shared<D> {
    /// Apply a remote delta. Returns whether the replica changed.
    fn apply_remote(&self, delta: &[u8], observer: Option<&UpdateSink>) -> Result<bool, DocError> {
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let applied = self.replica.apply_update(delta);
        // Changes caused by remote deltas are not ours to relay.
        let emitted = self.replica.take_emitted();
        if let Some(observer) = observer {
            for update in &emitted {
                observer(update);
            }
        }
        applied?;
        Ok(!emitted.is_empty())
    }
}

/// A client replica kept in sync with one room.
pub struct SyncClient<D: Replica = YrsReplica> {
    shared: Arc<Shared<D>>,
    client_id: ClientId,
    clock: AtomicU32,
    local_state: std::sync::Mutex<Option<Value>>,
    server_url: String,
    room: String,
    local_sink: Option<UpdateSink>,
    update_sink: Option<UpdateSink>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl<D: Replica> SyncClient<D> {
    /// Create a client with an empty replica for `room` on `server_url`
    /// (for example `ws://127.0.0.1:1234`).
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self::with_replica(D::empty()?, server_url, room))
    }

    pub fn with_replica(replica: D, server_url: impl Into<String>, room: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            shared: Arc::new(Shared {
                replica,
                gate: std::sync::Mutex::new(()),
                peers: Mutex::new(AwarenessTracker::new()),
                state: RwLock::new(ConnectionState::Disconnected),
            }),
            client_id: random_client_id(),
            clock: AtomicU32::new(0),
            local_state: std::sync::Mutex::new(None),
            server_url: server_url.into(),
            room: room.into(),
            local_sink: None,
            update_sink: None,
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Feed every delta produced by [`edit`](Self::edit) to `sink`.
    pub fn on_local_update(mut self, sink: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.local_sink = Some(Arc::new(sink));
        self
    }

    /// Feed every delta the replica emits to `sink`, whether it came from a
    /// local edit or from the server. Deltas reach `sink` in the order the
    /// replica applied them, which is what an update log needs to replay
    /// the shared document.
    pub fn on_update(mut self, sink: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.update_sink = Some(Arc::new(sink));
        self
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and start the handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let step1 = Frame::sync_step1(self.shared.replica.state_vector());
        out_tx
            .send(step1.encode())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let local = self.local_state.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if local.is_some() {
            let frame = self.awareness_frame(self.clock.load(Ordering::Acquire), local);
            let _ = out_tx.send(frame).await;
        }

        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);
        log::info!("Client {} connected to {url}", self.client_id);

        // The reader only replies; it must not keep the writer alive.
        let reply_tx = out_tx.downgrade();
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let observer = self.update_sink.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let incoming = handle_incoming(&shared, &reply_tx, &event_tx, observer.as_ref(), &data);
                        if let Err(e) = incoming.await {
                            log::warn!("Dropping frame from server: {e}");
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *shared.state.write().await = ConnectionState::Disconnected;
            *shared.peers.lock().await = AwarenessTracker::new();
            let _ = event_tx.try_send(SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Publish our presence tombstone and close the socket.
    pub async fn disconnect(&mut self) {
        if self.connection_state().await == ConnectionState::Connected {
            let _ = self.set_local_state(None).await;
        }
        // Dropping the last sender ends the writer task, which closes.
        self.outgoing_tx = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    /// Run a local edit against the replica and relay what it produced.
    pub async fn edit<R>(&self, f: impl FnOnce(&D) -> R) -> Result<R, ClientError> {
        let (result, updates) = {
            let _gate = self.shared.gate.lock().unwrap_or_else(|e| e.into_inner());
            let result = f(&self.shared.replica);
            let updates = self.shared.replica.take_emitted();
            if let Some(observer) = &self.update_sink {
                for update in &updates {
                    observer(update);
                }
            }
            (result, updates)
        };

        let connected = self.connection_state().await == ConnectionState::Connected;
        for update in updates {
            if let Some(sink) = &self.local_sink {
                sink(&update);
            }
            if connected {
                self.send(Frame::update(update).encode()).await?;
            }
        }
        Ok(result)
    }

    /// Replace our presence state; `None` removes it.
    pub async fn set_local_state(&self, state: Option<Value>) -> Result<(), ClientError> {
        let clock = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
        *self.local_state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(self.awareness_frame(clock, state)).await
    }

    pub fn local_state(&self) -> Option<Value> {
        self.local_state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Presence states of the other clients in the room.
    pub async fn peers(&self) -> std::collections::BTreeMap<ClientId, Value> {
        let mut states = self.shared.peers.lock().await.current_states();
        states.remove(&self.client_id);
        states
    }

    pub fn replica(&self) -> &D {
        &self.shared.replica
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    fn awareness_frame(&self, clock: u32, state: Option<Value>) -> Vec<u8> {
        let update = AwarenessUpdate::new(vec![AwarenessRecord {
            client_id: self.client_id,
            clock,
            state,
        }]);
        Frame::awareness(update.encode()).encode()
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(bytes).await.map_err(|_| ClientError::NotConnected)
    }
}

async fn handle_incoming<D: Replica>(
    shared: &Shared<D>,
    reply_tx: &mpsc::WeakSender<Vec<u8>>,
    event_tx: &mpsc::Sender<SyncEvent>,
    observer: Option<&UpdateSink>,
    data: &[u8],
) -> Result<(), ClientError> {
    match Frame::decode(data)? {
        Frame::Sync(SyncMessage::SyncStep1(state_vector)) => {
            let diff = shared.replica.encode_diff(&state_vector)?;
            if let (false, Some(tx)) = (diff.is_empty(), reply_tx.upgrade()) {
                let _ = tx.send(Frame::sync_step2(diff).encode()).await;
            }
        }
        Frame::Sync(SyncMessage::SyncStep2(delta)) => {
            if !delta.is_empty() {
                shared.apply_remote(&delta, observer)?;
            }
            let _ = event_tx.try_send(SyncEvent::Synced);
        }
        Frame::Sync(SyncMessage::Update(delta)) => {
            // Our own updates come back when the hub echoes to senders.
            if !delta.is_empty() && shared.apply_remote(&delta, observer)? {
                let _ = event_tx.try_send(SyncEvent::RemoteUpdate(delta));
            }
        }
        Frame::Awareness(payload) => {
            let update = AwarenessUpdate::decode(&payload)?;
            let change = shared.peers.lock().await.apply(&update, None);
            if !change.is_empty() {
                let _ = event_tx.try_send(SyncEvent::Awareness(change));
            }
        }
    }
    Ok(())
}

/// Random id in the 32-bit range other CRDT clients use.
fn random_client_id() -> ClientId {
    ClientId::from(Uuid::new_v4().as_u128() as u32)
}
