//! WebSocket transport in front of the [`SyncHub`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Room "notes" ── replica + presence
//!             ├── SyncServer ── SyncHub ┤
//! Client B ──┘    (one task per socket) └── Room "draft" ── replica + presence
//! ```
//!
//! The room is named by the request path (`ws://host/notes` joins
//! "notes"). Each socket task owns both halves of the stream: it feeds
//! binary messages to the hub and drains the connection's outbound queue
//! into the sink. A liveness monitor runs beside it; an awareness
//! sweeper runs once per server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use verso_core::{Replica, YrsReplica};

use crate::connection::Outbound;
use crate::hub::{HubConfig, HubError, SyncHub};
use crate::liveness::{spawn_monitor, Liveness};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between WebSocket pings
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `VERSO_BIND_ADDR` (or `PORT`) and
    /// `VERSO_HEARTBEAT_SECS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("VERSO_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.bind_addr = format!("127.0.0.1:{port}"),
                Err(_) => log::warn!("Ignoring invalid PORT {port:?}"),
            }
        }
        if let Some(secs) = lookup("VERSO_HEARTBEAT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval = Duration::from_secs(secs),
                _ => log::warn!("Ignoring invalid VERSO_HEARTBEAT_SECS {secs:?}"),
            }
        }
        config
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Room name for a request target: the path without its leading slash
/// and without any query string.
pub fn room_name_from_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.strip_prefix('/').unwrap_or(path).to_string()
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The sync server.
pub struct SyncServer<D: Replica = YrsReplica> {
    config: ServerConfig,
    hub: Arc<SyncHub<D>>,
}

impl<D: Replica> SyncServer<D> {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(SyncHub::new(config.hub.clone()));
        Self { config, hub }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<SyncHub<D>> {
        &self.hub
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let _sweeper = AbortOnDrop(self.spawn_awareness_sweeper());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let heartbeat = self.config.heartbeat_interval;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, heartbeat).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_awareness_sweeper(&self) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let period = (self.config.hub.awareness_timeout / 10).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let changed = hub.expire_awareness().await;
                if changed > 0 {
                    log::trace!("Expired stale presence in {changed} rooms");
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<SyncHub<D>>,
        heartbeat: Duration,
    ) -> Result<(), ServerError> {
        let mut target = String::from("/");
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(pq) = req.uri().path_and_query() {
                    target = pq.as_str().to_string();
                }
                Ok(resp)
            },
        )
        .await?;
        let room = room_name_from_path(&target);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (handle, mut outbound) = hub.new_connection();
        let id = handle.id();
        log::info!("WebSocket connection {id} from {addr} for room {room:?}");
        hub.add_connection(&room, handle.clone()).await?;

        let liveness = Arc::new(Liveness::new());
        let _monitor = AbortOnDrop(spawn_monitor(
            hub.clone(),
            room.clone(),
            handle,
            liveness.clone(),
            heartbeat,
        ));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("Frame of {} bytes from {id}", data.len());
                            // Rejected frames are logged and published by the hub.
                            match hub.handle_frame(&room, id, &data).await {
                                Err(HubError::UnknownConnection(..)) | Err(HubError::RoomNotFound(_)) => {
                                    log::debug!("Connection {id} was evicted, closing socket");
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Some(Ok(Message::Pong(_))) => liveness.pong_received(),
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {id} closed by peer");
                            break;
                        }
                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Ignoring text message from {id}");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {id}: {e}");
                            break;
                        }
                    }
                }

                item = outbound.recv() => {
                    let message = match item {
                        Some(Outbound::Frame(frame)) => Message::Binary(frame.to_vec().into()),
                        Some(Outbound::Ping) => Message::Ping(Default::default()),
                        Some(Outbound::Close) | None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if let Err(e) = ws_sender.send(message).await {
                        log::debug!("Send to {id} failed: {e}");
                        break;
                    }
                }
            }
        }

        hub.remove_connection(&room, id).await;
        Ok(())
    }
}
