use serde::{Deserialize, Serialize};

/// A registered account as returned to clients. The password hash never
/// leaves the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub avatar: String,
    pub status: Option<String>,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub message_text: String,
    pub is_read: bool,
    pub created_at: i64,
}

/// A thread row: the message plus display metadata for both ends.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    pub sender_avatar: String,
    pub receiver_name: String,
    pub receiver_avatar: String,
}

/// One inbox row per conversation partner: the latest message plus the
/// count of messages from that partner the caller has not read yet.
#[derive(Debug, Clone, Serialize)]
pub struct ChatDigest {
    pub id: i64,
    pub name: String,
    pub avatar: String,
    pub status: Option<String>,
    pub last_message: String,
    pub time: i64,
    pub unread: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    pub id: i64,
    pub name: String,
    pub avatar: String,
    pub status: Option<String>,
    pub online: bool,
    pub last_seen: Option<i64>,
}
