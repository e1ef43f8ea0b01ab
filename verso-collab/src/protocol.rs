//! Binary wire protocol for document sync and awareness.
//!
//! Every frame starts with a lib0 variable-length unsigned integer naming
//! the message type, followed by a type-specific payload:
//!
//! ```text
//! sync frame       ┌──────────┬──────────┬───────────────────────┐
//!                  │ varuint 0│ varuint  │ varbytes payload      │
//!                  │          │ sub-type │ (state vector / delta)│
//!                  └──────────┴──────────┴───────────────────────┘
//!                    sub-type: 0 SyncStep1, 1 SyncStep2, 2 Update
//!
//! awareness frame  ┌──────────┬──────────────────────────────────┐
//!                  │ varuint 1│ varbytes AwarenessUpdate          │
//!                  └──────────┴──────────────────────────────────┘
//!
//! AwarenessUpdate  varuint count, then per entry:
//!                  varuint client_id │ varuint clock │ varstring JSON
//! ```
//!
//! A JSON state of `null` is a tombstone (the client went away).
//! Integer and byte-string encodings come from `yrs::encoding`, so frames
//! are byte-compatible with y-websocket peers.

use serde_json::Value;
use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Numeric awareness client identifier.
pub type ClientId = u64;

/// Top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Document sync (state vector, diff, update)
    Sync = 0,
    /// Presence state
    Awareness = 1,
}

impl MessageType {
    fn from_tag(tag: u32) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Sync sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector: "this is what I have"
    SyncStep1(Vec<u8>),
    /// Diff answering a SyncStep1
    SyncStep2(Vec<u8>),
    /// Unsolicited incremental delta
    Update(Vec<u8>),
}

impl SyncMessage {
    const STEP1: u32 = 0;
    const STEP2: u32 = 1;
    const UPDATE: u32 = 2;

    fn tag(&self) -> u32 {
        match self {
            SyncMessage::SyncStep1(_) => Self::STEP1,
            SyncMessage::SyncStep2(_) => Self::STEP2,
            SyncMessage::Update(_) => Self::UPDATE,
        }
    }

    /// Raw payload (state vector or delta).
    pub fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(p) | SyncMessage::SyncStep2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    /// Still-encoded [`AwarenessUpdate`] payload.
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep1(state_vector))
    }

    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::SyncStep2(diff))
    }

    pub fn update(delta: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Update(delta))
    }

    pub fn awareness(payload: Vec<u8>) -> Self {
        Frame::Awareness(payload)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.message_type() as u32);
        match self {
            Frame::Sync(msg) => {
                buf.write_var(msg.tag());
                buf.write_buf(msg.payload());
            }
            Frame::Awareness(payload) => buf.write_buf(payload),
        }
        buf
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        match MessageType::from_tag(tag)? {
            MessageType::Sync => {
                let sub: u32 = cursor.read_var()?;
                let payload = cursor.read_buf()?.to_vec();
                let msg = match sub {
                    SyncMessage::STEP1 => SyncMessage::SyncStep1(payload),
                    SyncMessage::STEP2 => SyncMessage::SyncStep2(payload),
                    SyncMessage::UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncMessage(other)),
                };
                Ok(Frame::Sync(msg))
            }
            MessageType::Awareness => Ok(Frame::Awareness(cursor.read_buf()?.to_vec())),
        }
    }
}

/// One presence entry on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessRecord {
    pub client_id: ClientId,
    pub clock: u32,
    /// `None` marks the client as removed
    pub state: Option<Value>,
}

/// Batch of presence entries carried by an awareness frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AwarenessUpdate {
    pub records: Vec<AwarenessRecord>,
}

impl AwarenessUpdate {
    pub fn new(records: Vec<AwarenessRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.records.len() as u32);
        for record in &self.records {
            buf.write_var(record.client_id);
            buf.write_var(record.clock);
            let json = match &record.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            buf.write_string(&json);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let len: u32 = cursor.read_var()?;
        let mut records = Vec::with_capacity((len as usize).min(1024));
        for _ in 0..len {
            let client_id: ClientId = cursor.read_var()?;
            let clock: u32 = cursor.read_var()?;
            let state: Value = serde_json::from_str(cursor.read_string()?)
                .map_err(|e| ProtocolError::InvalidAwarenessState(e.to_string()))?;
            records.push(AwarenessRecord {
                client_id,
                clock,
                state: if state.is_null() { None } else { Some(state) },
            });
        }
        Ok(Self { records })
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),
    #[error("Unknown sync message type: {0}")]
    UnknownSyncMessage(u32),
    #[error("Invalid awareness state: {0}")]
    InvalidAwarenessState(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
