//! Wire protocol for the replication stream.
//!
//! Every binary WebSocket frame on `GET /replication/{table}` carries one
//! bincode-encoded [`FeedMessage`]:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ variant  │ fields                                       │
//! ├──────────┼──────────────────────────────────────────────┤
//! │ Update   │ seq: u64, payload: bytes                     │
//! │ Presence │ client_id, version, updated_at_ms, payload   │
//! │ Removed  │ client_id, version                           │
//! │ UpToDate │ cursor: u64                                  │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Update and presence bodies on the `PUT` endpoints are raw bytes and never
//! pass through this codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Identifies one independently replicated document.
pub type DocumentId = Uuid;

/// Identifies one client process (one open tab) within a document.
pub type ClientId = Uuid;

/// Query parameter carrying the document id on every endpoint.
pub const DOCUMENT_ID_PARAM: &str = "documentId";
/// Query parameter carrying the client id on the presence endpoint.
pub const CLIENT_ID_PARAM: &str = "clientId";
/// Query parameter carrying the resume cursor on the replication endpoint.
pub const OFFSET_PARAM: &str = "offset";

/// Tables exposed through the replication endpoint.
///
/// This is the full allow-list; any other table name is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// The append-only update log.
    DocumentUpdates,
    /// The per-client presence registry.
    PresenceUpdates,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::DocumentUpdates, Table::PresenceUpdates];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::DocumentUpdates => "document_updates",
            Table::PresenceUpdates => "presence_updates",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "document_updates" => Ok(Table::DocumentUpdates),
            "presence_updates" => Ok(Table::PresenceUpdates),
            other => Err(ProtocolError::UnknownTable(other.to_string())),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMessage {
    /// A row of the update log. `seq` starts at 1 per document.
    Update { seq: u64, payload: Vec<u8> },
    /// The latest presence blob of one client.
    Presence {
        client_id: ClientId,
        version: u64,
        updated_at_ms: u64,
        payload: Vec<u8>,
    },
    /// A client withdrew its presence.
    PresenceRemoved { client_id: ClientId, version: u64 },
    /// Control message: everything up to `cursor` has been delivered.
    UpToDate { cursor: u64 },
}

impl FeedMessage {
    /// Stream position of this message: the update sequence, the presence
    /// version, or the cursor of a control message.
    pub fn position(&self) -> u64 {
        match self {
            FeedMessage::Update { seq, .. } => *seq,
            FeedMessage::Presence { version, .. } => *version,
            FeedMessage::PresenceRemoved { version, .. } => *version,
            FeedMessage::UpToDate { cursor } => *cursor,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, FeedMessage::UpToDate { .. })
    }

    /// The table a change message belongs to. Control messages belong to both.
    pub fn table(&self) -> Option<Table> {
        match self {
            FeedMessage::Update { .. } => Some(Table::DocumentUpdates),
            FeedMessage::Presence { .. } | FeedMessage::PresenceRemoved { .. } => {
                Some(Table::PresenceUpdates)
            }
            FeedMessage::UpToDate { .. } => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
