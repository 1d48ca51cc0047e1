//! Document protocol message types
//!
//! Messages exchanged between [`WsRemote`](super::WsRemote) and
//! [`DocumentServer`](super::DocumentServer), CBOR encoded in WebSocket
//! binary frames. Slice values travel as JSON bytes.
//!
//! A connection starts with `join` (naming the session) and `joined`. After
//! that the client subscribes to slices and issues write-merges and deletes;
//! the server answers requests with `ack` or `error` and pushes `snapshot`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RemoteError;

/// Peer ID for identifying a client connection
pub type PeerId = String;

/// Protocol version
pub const PROTOCOL_V1: &str = "1";

/// Messages sent to the document server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake, binds the connection to one session
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "senderId")]
        sender_id: PeerId,
        session: String,
        #[serde(rename = "supportedProtocolVersions")]
        supported_protocol_versions: Vec<String>,
    },

    /// Start receiving snapshots of a slice document
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        session: String,
        slice: String,
    },

    /// Stop receiving snapshots
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
    },

    /// Upsert the `value` field of a slice document
    #[serde(rename = "writeMerge")]
    WriteMerge {
        #[serde(rename = "requestId")]
        request_id: u64,
        session: String,
        slice: String,
        /// JSON-encoded value
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },

    /// Delete a slice document
    #[serde(rename = "delete")]
    Delete {
        #[serde(rename = "requestId")]
        request_id: u64,
        session: String,
        slice: String,
    },
}

/// Error classes reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    PermissionDenied,
    InvalidRequest,
    Internal,
}

/// Messages received from the document server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake response
    #[serde(rename = "joined")]
    Joined {
        #[serde(rename = "senderId")]
        sender_id: PeerId,
        #[serde(rename = "selectedProtocolVersion")]
        selected_protocol_version: String,
    },

    /// Current state of a subscribed document
    #[serde(rename = "snapshot")]
    Snapshot {
        #[serde(rename = "subscriptionId")]
        subscription_id: u64,
        slice: String,
        /// Whether the document exists; `value` is empty when it does not
        exists: bool,
        /// JSON-encoded value
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },

    /// Request completed
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
    },

    /// Request, subscription or handshake failed
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<u64>,
        #[serde(rename = "subscriptionId", default)]
        subscription_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

impl ErrorCode {
    /// Client-side error for this code
    pub fn into_error(self, message: String) -> RemoteError {
        match self {
            ErrorCode::PermissionDenied => RemoteError::PermissionDenied(message),
            ErrorCode::InvalidRequest => RemoteError::Protocol(message),
            ErrorCode::Internal => RemoteError::Internal(message),
        }
    }
}

impl ClientMessage {
    /// Create a join message
    pub fn join(sender_id: &str, session: &str) -> Self {
        ClientMessage::Join {
            sender_id: sender_id.to_string(),
            session: session.to_string(),
            supported_protocol_versions: vec![PROTOCOL_V1.to_string()],
        }
    }

    /// Create a write-merge message
    pub fn write_merge(
        request_id: u64,
        session: &str,
        slice: &str,
        value: &Value,
    ) -> Result<Self, RemoteError> {
        Ok(ClientMessage::WriteMerge {
            request_id,
            session: session.to_string(),
            slice: slice.to_string(),
            value: encode_value(value)?,
        })
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode_cbor(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode_cbor(bytes)
    }
}

impl ServerMessage {
    /// Create a joined message
    pub fn joined(sender_id: &str) -> Self {
        ServerMessage::Joined {
            sender_id: sender_id.to_string(),
            selected_protocol_version: PROTOCOL_V1.to_string(),
        }
    }

    /// Create a snapshot message; `None` means the document does not exist
    pub fn snapshot(
        subscription_id: u64,
        slice: &str,
        value: Option<&Value>,
    ) -> Result<Self, RemoteError> {
        Ok(ServerMessage::Snapshot {
            subscription_id,
            slice: slice.to_string(),
            exists: value.is_some(),
            value: value.map(encode_value).transpose()?.unwrap_or_default(),
        })
    }

    /// Create an error reply to a request
    pub fn request_error(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id: Some(request_id),
            subscription_id: None,
            code,
            message: message.into(),
        }
    }

    /// Create an error for a subscription
    pub fn subscription_error(
        subscription_id: u64,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            request_id: None,
            subscription_id: Some(subscription_id),
            code,
            message: message.into(),
        }
    }

    /// Create a connection-level error
    pub fn connection_error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id: None,
            subscription_id: None,
            code,
            message: message.into(),
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode_cbor(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode_cbor(bytes)
    }
}

/// Encode a slice value as JSON bytes
pub fn encode_value(value: &Value) -> Result<Vec<u8>, RemoteError> {
    serde_json::to_vec(value).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Decode JSON bytes into a slice value
pub fn decode_value(bytes: &[u8]) -> Result<Value, RemoteError> {
    serde_json::from_slice(bytes).map_err(|e| RemoteError::Decode(e.to_string()))
}

fn encode_cbor<T: Serialize>(message: &T) -> Result<Vec<u8>, RemoteError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, RemoteError> {
    ciborium::from_reader(bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR decoding failed: {}", e)))
}
