//! Chat wire frames.
//!
//! Inbound frames are a tagged union keyed on `type` and decoded strictly per
//! variant. Every inbound frame gets exactly one [`Response`] echoing its
//! type; everything the hub pushes on its own is a [`ServerFrame`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use super::message::Message;
use super::room::PmRoom;
use super::user::UserSnapshot;
use crate::error::{ChatError, FrameError};

/// Frame types a client may send.
const CLIENT_FRAME_TYPES: &[&str] = &["bind", "ping", "message", "createroom", "leaveroom", "request"];

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Bind {
        uid: u64,
        key: String,
    },
    Ping {
        /// A bare `ping{}` counts as an active ping.
        #[serde(default = "default_active")]
        active: bool,
    },
    Message {
        key: String,
        text: String,
        tag: String,
    },
    #[serde(rename = "createroom")]
    CreateRoom {
        users: Vec<u64>,
    },
    #[serde(rename = "leaveroom")]
    LeaveRoom {
        room: String,
    },
    Request {
        request: RequestKind,
    },
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "userList")]
    UserList,
    #[serde(rename = "messageList")]
    MessageList,
}

impl ClientFrame {
    /// The `type` this frame's response echoes.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Bind { .. } => "bind",
            ClientFrame::Ping { .. } => "ping",
            ClientFrame::Message { .. } => "message",
            ClientFrame::CreateRoom { .. } => "createroom",
            ClientFrame::LeaveRoom { .. } => "leaveroom",
            ClientFrame::Request { .. } => "request",
        }
    }
}

/// Decode one text frame, telling apart bad JSON, a missing or unknown
/// `type`, and a known type with bad fields.
pub fn decode_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError::NotJson(e.to_string()))?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(FrameError::MissingType),
    };
    let Some(&kind) = CLIENT_FRAME_TYPES.iter().find(|t| **t == kind) else {
        return Err(FrameError::UnknownType(kind));
    };
    serde_json::from_value(value).map_err(|e| FrameError::Malformed {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl FrameError {
    /// Type to echo in the response, when the frame got far enough to have one.
    pub fn response_kind(&self) -> &'static str {
        match self {
            FrameError::Malformed { kind, .. } => CLIENT_FRAME_TYPES
                .iter()
                .copied()
                .find(|t| *t == kind.as_str())
                .unwrap_or("error"),
            _ => "error",
        }
    }
}

/// The single reply to an inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub result: bool,
    pub errors: Vec<String>,
    /// Set on successful `createroom`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl Response {
    pub fn ok(kind: &'static str) -> Self {
        Self {
            kind,
            result: true,
            errors: Vec::new(),
            room: None,
        }
    }

    pub fn failed(kind: &'static str, errors: Vec<String>) -> Self {
        Self {
            kind,
            result: false,
            errors,
            room: None,
        }
    }

    pub fn from_result(kind: &'static str, result: Result<(), ChatError>) -> Self {
        match result {
            Ok(()) => Self::ok(kind),
            Err(e) => Self::failed(kind, vec![e.to_string()]),
        }
    }

    pub fn with_room(mut self, room: String) -> Self {
        self.room = Some(room);
        self
    }

    pub fn encode(&self) -> String {
        encode_json(self)
    }
}

/// Public view of an identity in a user list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    #[serde(flatten)]
    pub user: UserSnapshot,
    pub active: bool,
    pub banned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub name: String,
    pub creator: u64,
    pub members: Vec<u64>,
    pub last_message: DateTime<Utc>,
}

impl From<&PmRoom> for RoomView {
    fn from(room: &PmRoom) -> Self {
        Self {
            name: room.name.clone(),
            creator: room.creator,
            members: room.members.iter().copied().collect(),
            last_message: room.last_message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: u64,
    pub sender: UserSnapshot,
    pub text: String,
    pub tag: String,
    pub posted_at: DateTime<Utc>,
}

impl From<&Message> for MessageView {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            sender: m.sender.clone(),
            text: m.text.clone(),
            tag: m.tag.clone(),
            posted_at: m.posted_at,
        }
    }
}

/// Frames the server pushes without being asked, plus request snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Localized notice. `uid` is the identity the notice is about.
    #[serde(rename = "system")]
    System {
        message: String,
        subtype: String,
        uid: u64,
    },

    #[serde(rename = "userList")]
    UserList {
        result: bool,
        errors: Vec<String>,
        users: Vec<UserView>,
        rooms: Vec<RoomView>,
    },

    /// Also used to fan out freshly posted messages.
    #[serde(rename = "messageList")]
    MessageList {
        result: bool,
        errors: Vec<String>,
        messages: Vec<MessageView>,
    },
}

impl ServerFrame {
    pub fn user_list(users: Vec<UserView>, rooms: Vec<RoomView>) -> Self {
        ServerFrame::UserList {
            result: true,
            errors: Vec::new(),
            users,
            rooms,
        }
    }

    pub fn message_list(messages: Vec<MessageView>) -> Self {
        ServerFrame::MessageList {
            result: true,
            errors: Vec::new(),
            messages,
        }
    }

    pub fn encode(&self) -> String {
        encode_json(self)
    }
}

fn encode_json<T: Serialize>(frame: &T) -> String {
    match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "failed to encode outbound frame");
            r#"{"type":"error","result":false,"errors":["internal encoding error"]}"#.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bind() {
        let frame = decode_frame(r#"{"type":"bind","uid":7,"key":"abc"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Bind {
                uid: 7,
                key: "abc".into()
            }
        );
        assert_eq!(frame.kind(), "bind");
    }

    #[test]
    fn test_decode_ping_defaults_to_active() {
        assert_eq!(
            decode_frame(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping { active: true }
        );
        assert_eq!(
            decode_frame(r#"{"type":"ping","active":false}"#).unwrap(),
            ClientFrame::Ping { active: false }
        );
    }

    #[test]
    fn test_decode_request_kinds() {
        assert_eq!(
            decode_frame(r#"{"type":"request","request":"messageList"}"#).unwrap(),
            ClientFrame::Request {
                request: RequestKind::MessageList
            }
        );
        assert!(matches!(
            decode_frame(r#"{"type":"request","request":"everything"}"#),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn test_decode_errors_are_classified() {
        assert!(matches!(decode_frame("not json"), Err(FrameError::NotJson(_))));
        assert_eq!(decode_frame(r#"{"uid":1}"#), Err(FrameError::MissingType));
        assert_eq!(
            decode_frame(r#"{"type":"dance"}"#),
            Err(FrameError::UnknownType("dance".into()))
        );

        let err = decode_frame(r#"{"type":"createroom","users":"everyone"}"#).unwrap_err();
        assert_eq!(err.response_kind(), "createroom");
        assert_eq!(FrameError::MissingType.response_kind(), "error");
    }

    #[test]
    fn test_response_shape() {
        let json: Value = serde_json::from_str(&Response::ok("ping").encode()).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["result"], true);
        assert_eq!(json["errors"], serde_json::json!([]));
        assert!(json.get("room").is_none());

        let json: Value = serde_json::from_str(
            &Response::ok("createroom").with_room("room-4".into()).encode(),
        )
        .unwrap();
        assert_eq!(json["room"], "room-4");

        let failed = Response::from_result("message", Err(ChatError::EmptyMessage));
        assert!(!failed.result);
        assert_eq!(failed.errors, vec!["Message cannot be empty".to_string()]);
    }

    #[test]
    fn test_system_frame_shape() {
        let frame = ServerFrame::System {
            message: "hi".into(),
            subtype: "welcome".into(),
            uid: 7,
        };
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["type"], "system");
        assert_eq!(json["subtype"], "welcome");
        assert_eq!(json["uid"], 7);
    }

    #[test]
    fn test_user_list_flattens_snapshot() {
        let mut user = UserSnapshot::system("alice");
        user.uid = 3;
        let frame = ServerFrame::user_list(
            vec![UserView {
                user,
                active: true,
                banned: false,
            }],
            Vec::new(),
        );
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["type"], "userList");
        assert_eq!(json["users"][0]["uid"], 3);
        assert_eq!(json["users"][0]["username"], "alice");
        assert_eq!(json["users"][0]["active"], true);
        assert_eq!(json["rooms"], serde_json::json!([]));
    }
}
