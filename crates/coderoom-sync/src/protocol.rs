//! Wire messages exchanged between a client and the room hub.
//!
//! Every frame is a JSON object with a `type` tag, for example
//! `{"type":"SYNC_REQUEST","stateVector":{"alice":3}}`.

use crate::error::ProtocolError;
use coderoom_core::{ConnectionId, ReplicaId, RoomId, StateVector};
use coderoom_doc::{AwarenessDelta, Operation, OutputUpdate};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    /// First frame from a client. A state vector asks for only the missing
    /// operations instead of the whole document.
    Join {
        room: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replica_id: Option<ReplicaId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_vector: Option<StateVector>,
    },
    /// Reply to `JOIN`.
    Welcome {
        connection_id: ConnectionId,
        replica_id: ReplicaId,
        operations: Vec<Operation>,
        presence: Vec<AwarenessDelta>,
        /// Latest run output, if anyone has run or cleared it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<OutputUpdate>,
    },
    SyncRequest {
        state_vector: StateVector,
    },
    /// Reply to `SYNC_REQUEST`. The hub's state vector tells the client
    /// which of its own operations have arrived.
    SyncResponse {
        operations: Vec<Operation>,
        #[serde(default)]
        state_vector: StateVector,
    },
    Update {
        operation: Operation,
    },
    AwarenessDelta {
        delta: AwarenessDelta,
    },
    PresenceLeave {
        connection_id: ConnectionId,
    },
    /// A run or clear of the room's output.
    Output {
        output: OutputUpdate,
    },
    Ping,
    Pong,
}

impl Message {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::Welcome { .. } => "WELCOME",
            Message::SyncRequest { .. } => "SYNC_REQUEST",
            Message::SyncResponse { .. } => "SYNC_RESPONSE",
            Message::Update { .. } => "UPDATE",
            Message::AwarenessDelta { .. } => "AWARENESS_DELTA",
            Message::PresenceLeave { .. } => "PRESENCE_LEAVE",
            Message::Output { .. } => "OUTPUT",
            Message::Ping => "PING",
            Message::Pong => "PONG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderoom_core::OpId;
    use coderoom_doc::PresenceFields;

    #[test]
    fn test_tags_and_field_names() {
        let message = Message::SyncRequest {
            state_vector: StateVector::from_entries([("alice", 3)]),
        };
        let json: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "SYNC_REQUEST");
        assert_eq!(json["stateVector"]["alice"], 3);

        let leave = Message::PresenceLeave {
            connection_id: ConnectionId::new("c1"),
        };
        let json: serde_json::Value = serde_json::from_str(&leave.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "PRESENCE_LEAVE");
        assert_eq!(json["connectionId"], "c1");
    }

    #[test]
    fn test_sync_response_carries_state_vector() {
        let response = Message::SyncResponse {
            operations: Vec::new(),
            state_vector: StateVector::from_entries([("bob", 7)]),
        };
        let json: serde_json::Value = serde_json::from_str(&response.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "SYNC_RESPONSE");
        assert_eq!(json["stateVector"]["bob"], 7);

        let bare = Message::decode(r#"{"type":"SYNC_RESPONSE","operations":[]}"#).unwrap();
        assert_eq!(
            bare,
            Message::SyncResponse {
                operations: Vec::new(),
                state_vector: StateVector::new(),
            }
        );
    }

    #[test]
    fn test_output_and_welcome_without_output() {
        let output = Message::Output {
            output: OutputUpdate {
                code: "console.log(1)".into(),
                clock: 2,
                replica: ReplicaId::new("alice"),
            },
        };
        let json: serde_json::Value = serde_json::from_str(&output.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "OUTPUT");
        assert_eq!(json["output"]["code"], "console.log(1)");
        assert_eq!(Message::decode(&output.encode().unwrap()).unwrap(), output);

        let welcome = Message::decode(
            r#"{"type":"WELCOME","connectionId":"c1","replicaId":"r1","operations":[],"presence":[]}"#,
        )
        .unwrap();
        assert!(matches!(welcome, Message::Welcome { output: None, .. }));
    }

    #[test]
    fn test_decode_update() {
        let message = Message::Update {
            operation: Operation::Delete {
                id: OpId::new("bob", 2),
                target: OpId::new("alice", 1),
            },
        };
        let text = message.encode().unwrap();
        assert_eq!(Message::decode(&text).unwrap(), message);
        assert_eq!(message.kind(), "UPDATE");
    }

    #[test]
    fn test_join_optional_fields() {
        let join = Message::decode(r#"{"type":"JOIN","room":"pairing"}"#).unwrap();
        assert_eq!(
            join,
            Message::Join {
                room: RoomId::new("pairing"),
                replica_id: None,
                state_vector: None,
            }
        );

        let awareness = Message::AwarenessDelta {
            delta: AwarenessDelta {
                connection_id: ConnectionId::new("c1"),
                clock: 1,
                fields: PresenceFields::default(),
            },
        };
        assert_eq!(Message::decode(&awareness.encode().unwrap()).unwrap(), awareness);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(Message::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(Message::decode(r#"{"type":"SHOUT"}"#).is_err());
        assert!(Message::decode(r#"{"type":"UPDATE"}"#).is_err());
    }
}
