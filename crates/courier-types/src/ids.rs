use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of an authenticated user. Issued externally; opaque here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

/// A logical chat room (1:1 or group conversation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

/// One live transport session. A user may hold several at once (multi-device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-assigned durable message id. Monotone per database, so ranges
/// (`id <= up_to`) are well-defined for the bulk-read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// Client-generated idempotency key correlating an optimistic send with its
/// eventual durable record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientTempId(pub String);

impl ClientTempId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Canonical per-room role. Pin/unpin require an elevated role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Member,
    Admin,
    Owner,
}

impl RoomRole {
    pub fn can_pin(self) -> bool {
        matches!(self, RoomRole::Admin | RoomRole::Owner)
    }

    /// Stable string form used in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            RoomRole::Member => "member",
            RoomRole::Admin => "admin",
            RoomRole::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(RoomRole::Member),
            "admin" => Some(RoomRole::Admin),
            "owner" => Some(RoomRole::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ClientTempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip() {
        for role in [RoomRole::Member, RoomRole::Admin, RoomRole::Owner] {
            assert_eq!(RoomRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(RoomRole::parse("moderator"), None);
    }

    #[test]
    fn only_elevated_roles_pin() {
        assert!(!RoomRole::Member.can_pin());
        assert!(RoomRole::Admin.can_pin());
        assert!(RoomRole::Owner.can_pin());
    }

    #[test]
    fn message_ids_order() {
        assert!(MessageId(5000) < MessageId(5001));
    }
}
