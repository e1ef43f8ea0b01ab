//! Connection handles shared between the transport and the hub.
//!
//! The hub never touches sockets. Each connection is represented by a
//! stable [`ConnectionId`] plus the sending half of a bounded outbound
//! queue; the transport task owning the socket drains the other half.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stable connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded protocol frame
    Frame(Arc<Vec<u8>>),
    /// Transport-level heartbeat probe
    Ping,
    /// Close the socket
    Close,
}

/// Outbound queue rejected a frame; the connection is considered gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Connection {0} is not accepting frames")]
pub struct SendError(pub ConnectionId);

/// Cheap, cloneable handle to one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the transport should drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::new(),
                outbound: tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an encoded frame without waiting.
    ///
    /// A closed or full queue is a send failure; no retry is attempted.
    pub fn send_frame(&self, frame: Arc<Vec<u8>>) -> Result<(), SendError> {
        self.outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|_| SendError(self.id))
    }

    pub fn ping(&self) -> Result<(), SendError> {
        self.outbound
            .try_send(Outbound::Ping)
            .map_err(|_| SendError(self.id))
    }

    /// Ask the transport to close the socket. Best effort.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (handle, mut rx) = ConnectionHandle::channel(4);
        handle.send_frame(Arc::new(vec![1])).unwrap();
        handle.ping().unwrap();
        handle.send_frame(Arc::new(vec![2])).unwrap();

        assert_eq!(rx.recv().await, Some(Outbound::Frame(Arc::new(vec![1]))));
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        assert_eq!(rx.recv().await, Some(Outbound::Frame(Arc::new(vec![2]))));
    }

    #[test]
    fn test_full_queue_is_send_failure() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        handle.send_frame(Arc::new(vec![1])).unwrap();
        assert_eq!(handle.send_frame(Arc::new(vec![2])), Err(SendError(handle.id())));
    }

    #[test]
    fn test_dropped_receiver_is_send_failure() {
        let (handle, rx) = ConnectionHandle::channel(8);
        drop(rx);
        assert!(handle.is_closed());
        assert!(handle.send_frame(Arc::new(vec![1])).is_err());
        assert!(handle.ping().is_err());
        // close on a dead queue must not panic
        handle.close();
    }
}
