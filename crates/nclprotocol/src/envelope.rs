//! Message envelope carried on the bus.
//!
//! Every NCL message is a JSON object with a string metadata map and an
//! arbitrary JSON payload. The message type in metadata tells the receiver
//! how to decode the payload.

use crate::error::{Error, Result};
use crate::messages::Payload;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier of a message.
pub const KEY_MESSAGE_ID: &str = "MessageID";
/// Type of the payload.
pub const KEY_MESSAGE_TYPE: &str = "Type";
/// Identifier of the sending component.
pub const KEY_SOURCE: &str = "Source";
/// RFC 3339 timestamp of the originating event.
pub const KEY_EVENT_TIME: &str = "EventTime";
/// Sequence number of the event that produced the message.
pub const KEY_SEQ_NUM: &str = "SeqNum";
/// Error code on error replies.
pub const KEY_ERROR_CODE: &str = "ErrorCode";

/// Type of positive acknowledgements.
pub const ACK_MESSAGE_TYPE: &str = "Ack";
/// Type of error replies.
pub const ERROR_MESSAGE_TYPE: &str = "Error";

/// A bus message: metadata plus JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    message: String,
}

impl Message {
    /// Build a message of the given type with a fresh message id.
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(KEY_MESSAGE_TYPE.to_string(), message_type.into());
        metadata.insert(
            KEY_MESSAGE_ID.to_string(),
            uuid::Uuid::new_v4().to_string(),
        );
        Self { metadata, payload }
    }

    /// Build a message from a typed protocol payload.
    pub fn from_payload<T: Payload>(payload: &T) -> Result<Self> {
        Ok(Self::new(T::MESSAGE_TYPE, serde_json::to_value(payload)?))
    }

    /// Positive acknowledgement for a received message.
    pub fn ack() -> Self {
        Self::new(ACK_MESSAGE_TYPE, serde_json::Value::Null)
    }

    /// Error reply carrying the error's code and message.
    pub fn error(err: &Error) -> Self {
        let payload = serde_json::json!({ "message": err.to_string() });
        Self::new(ERROR_MESSAGE_TYPE, payload).with_metadata(KEY_ERROR_CODE, err.code())
    }

    /// Add or replace a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.metadata_value(KEY_MESSAGE_TYPE)
    }

    pub fn id(&self) -> Option<&str> {
        self.metadata_value(KEY_MESSAGE_ID)
    }

    /// Sequence number attached by a dispatcher, if any.
    pub fn seq_num(&self) -> Option<u64> {
        self.metadata_value(KEY_SEQ_NUM)?.parse().ok()
    }

    pub fn is_error(&self) -> bool {
        self.message_type() == Some(ERROR_MESSAGE_TYPE)
    }

    /// Reconstruct the remote error carried by an error reply.
    pub fn as_error(&self) -> Option<Error> {
        if !self.is_error() {
            return None;
        }
        let message = serde_json::from_value::<ErrorPayload>(self.payload.clone())
            .map(|p| p.message)
            .unwrap_or_else(|_| self.payload.to_string());
        Some(Error::Remote {
            code: self
                .metadata_value(KEY_ERROR_CODE)
                .unwrap_or("Unknown")
                .to_string(),
            message,
        })
    }

    /// Decode the payload as `T`, checking the message type first.
    pub fn decode<T: Payload>(&self) -> Result<T> {
        if let Some(err) = self.as_error() {
            return Err(err);
        }
        match self.message_type() {
            Some(t) if t == T::MESSAGE_TYPE => Ok(serde_json::from_value(self.payload.clone())?),
            other => Err(Error::UnexpectedMessageType {
                expected: T::MESSAGE_TYPE,
                actual: other.unwrap_or_default().to_string(),
            }),
        }
    }

    /// Serialize to bytes for the bus.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from bus bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HeartbeatRequest, HeartbeatResponse};
    use crate::models::Resources;

    fn heartbeat() -> HeartbeatRequest {
        HeartbeatRequest {
            node_id: "node-1".into(),
            available_capacity: Resources::default(),
            queue_used_capacity: Resources::default(),
            last_orchestrator_seq_num: 7,
        }
    }

    #[test]
    fn test_new_sets_type_and_id() {
        let msg = Message::from_payload(&heartbeat()).unwrap();
        assert_eq!(msg.message_type(), Some("HeartbeatRequest"));
        assert!(msg.id().is_some());

        let other = Message::from_payload(&heartbeat()).unwrap();
        assert_ne!(msg.id(), other.id());
    }

    #[test]
    fn test_decode_checks_type() {
        let msg = Message::from_payload(&heartbeat()).unwrap();
        let decoded: HeartbeatRequest = msg.decode().unwrap();
        assert_eq!(decoded.last_orchestrator_seq_num, 7);

        let err = msg.decode::<HeartbeatResponse>().unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessageType { .. }));
    }

    #[test]
    fn test_error_reply_round_trip() {
        let reply = Message::error(&Error::HandshakeRequired("node-1".into()));
        let bytes = reply.encode().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        let err = decoded.decode::<HeartbeatResponse>().unwrap_err();
        assert!(err.is_handshake_required());
        assert!(err.to_string().contains("node-1"));
    }

    #[test]
    fn test_seq_num_metadata() {
        let msg = Message::new("ExecutionUpsert", serde_json::json!({}));
        assert_eq!(msg.seq_num(), None);

        let msg = msg.with_metadata(KEY_SEQ_NUM, 42u64);
        assert_eq!(msg.seq_num(), Some(42));
    }
}
