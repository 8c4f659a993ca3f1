//! Error types shared across the chat core.
//!
//! The `Display` text of every user-facing variant is what ends up in the
//! `errors` array of a response frame, so messages are written for humans.

use thiserror::Error;

/// Errors a chat operation reports back to the requesting connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    #[error("Invalid or expired key")]
    InvalidKey,

    #[error("Invalid user id")]
    InvalidIdentity,

    #[error("This connection is already bound to a user")]
    AlreadyBound,

    #[error("You must bind before sending this request")]
    NotBound,

    #[error("Could not load your profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message too long (max {0} characters)")]
    MessageTooLong(usize),

    #[error("You are banned from chat")]
    Banned,

    #[error("You are blocked from chat for {0} more seconds")]
    Blocked(i64),

    #[error("You are not allowed to post in {0}")]
    TagDenied(String),

    #[error("{0}")]
    Room(#[from] RoomError),

    #[error("{0}")]
    Command(String),

    #[error("Server is busy, please try again")]
    Busy,
}

/// Room registry failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoomError {
    #[error("A room needs at least 2 members")]
    TooFewMembers,

    #[error("A room with these members already exists: {0}")]
    DuplicateRoom(String),

    #[error("Unknown user: {0}")]
    UnknownMember(u64),

    #[error("Banned or blocked users cannot create rooms")]
    CreatorRestricted,

    #[error("No such room: {0}")]
    NoSuchRoom(String),

    #[error("You are not a member of {0}")]
    NotMember(String),
}

/// Failures from the external profile source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProfileError {
    #[error("profile request timed out")]
    Timeout,

    #[error("profile request failed: {0}")]
    Transport(String),

    #[error("profile source returned status {0}")]
    Status(u16),

    #[error("profile response was malformed: {0}")]
    Malformed(String),

    #[error("no such user: {0}")]
    NotFound(u64),
}

impl ProfileError {
    /// Whether the failure says something about the identity itself rather
    /// than about the profile source being unreachable.
    pub fn is_definitive(&self) -> bool {
        matches!(self, ProfileError::NotFound(_))
    }
}

/// Inbound frame decode failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    NotJson(String),

    #[error("Frame has no type")]
    MissingType,

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Failures while serving one token request.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request timed out")]
    Timeout,

    #[error("request exceeded {0} bytes")]
    TooLarge(usize),

    #[error("connection closed before a complete request")]
    Incomplete,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
