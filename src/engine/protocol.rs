//! Wire protocol frames
//!
//! Bidirectional JSON frames exchanged with collaborating clients. The
//! payload is typed per frame kind; unknown payload fields pass through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::PositionRange;
use crate::document::DocumentSnapshot;
use crate::ops::Operation;
use crate::position::{AuthorId, Position};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Operation,
    Presence,
    Sync,
    Ack,
    Error,
}

/// One frame on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub author_id: AuthorId,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        payload: &impl Serialize,
        author_id: AuthorId,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            author_id,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationPayload {
    pub operation: Operation,
    pub document_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
    Offline,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresencePayload {
    pub author_id: AuthorId,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<PositionRange>,
    pub last_active: DateTime<Utc>,
    pub status: PresenceStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPayload {
    pub document_id: String,
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<DocumentSnapshot>,
    #[serde(default)]
    pub since_version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_tags() {
        let ack = AckPayload {
            message_id: "m1".to_string(),
            success: true,
            error: None,
        };
        let msg = Message::new(MessageKind::Ack, &ack, "author".to_string()).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ack\""));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MessageKind::Ack);
        let payload: AckPayload = serde_json::from_value(back.payload).unwrap();
        assert!(payload.success);
    }
}
