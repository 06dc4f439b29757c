use serde::{Deserialize, Serialize};

use crate::store::Message;

/// Events a client may issue over an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    SendMessage { room_id: String, content: String },
    TypingStart { room_id: String },
    TypingStop { room_id: String },
}

/// Events delivered to connections. Presence and typing notices are
/// ephemeral; only `message-received` carries durably recorded data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RoomJoined {
        room_id: String,
        message: String,
    },
    UserJoined {
        room_id: String,
        user_id: String,
        username: String,
        timestamp: String,
    },
    UserLeft {
        room_id: String,
        user_id: String,
        username: String,
        timestamp: String,
    },
    MessageReceived(Message),
    UserTyping {
        room_id: String,
        user_id: String,
        username: String,
        is_typing: bool,
    },
    Error {
        message: String,
    },
}
