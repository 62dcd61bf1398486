//! JSON frames exchanged over the chat socket, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::{
    error::AppErr,
    models::{FileDescriptor, Message, MessageKind, Participant, Room},
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        pin:      String,
        nickname: String,
    },
    Attach {
        session_token: String,
    },
    SendMessage {
        #[serde(default)]
        kind:    Option<MessageKind>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        file:    Option<FileDescriptor>,
    },
    Typing {
        #[serde(default = "yes")]
        is_typing: bool,
    },
    DeleteMessage {
        message_id: i64,
    },
    LeaveRoom,
    Ping,
}

fn yes() -> bool { true }

#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub participant_id: String,
    pub nickname:       String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Disconnected,
    Moved,
    Inactive,
    Evicted,
    RoomClosed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined {
        participant:   Participant,
        room:          Room,
        session_token: String,
        members:       Vec<Member>,
    },
    UserJoined {
        room_id:        String,
        participant_id: String,
        nickname:       String,
    },
    UserLeft {
        room_id:        String,
        participant_id: String,
        nickname:       String,
        reason:         LeaveReason,
    },
    UserTyping {
        room_id:        String,
        participant_id: String,
        nickname:       String,
        is_typing:      bool,
    },
    NewMessage {
        message: Message,
    },
    MessageDeleted {
        room_id:    String,
        message_id: i64,
    },
    /// Sent to a connection whose own binding was released.
    Left {
        room_id: String,
        reason:  LeaveReason,
    },
    Pong,
    Error {
        code:    String,
        message: String,
    },
}

impl From<&AppErr> for ServerEvent {
    fn from(e: &AppErr) -> Self {
        ServerEvent::Error { code: e.code().into(), message: e.public_message() }
    }
}
