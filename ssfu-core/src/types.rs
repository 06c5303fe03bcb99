//! Common identifier types and room roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a live peer connection.
///
/// Either supplied by the client in the connection query or generated by the
/// server as a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Server-generated id for clients that did not supply one.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one media track, stable across forwarding hops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A peer's role within one room.
///
/// Sources publish tracks into the room, viewers receive every track
/// published by other members, `Both` does both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Viewer,
    Source,
    Both,
}

impl MemberRole {
    #[must_use]
    pub const fn can_view(self) -> bool {
        matches!(self, Self::Viewer | Self::Both)
    }

    #[must_use]
    pub const fn can_publish(self) -> bool {
        matches!(self, Self::Source | Self::Both)
    }

    /// Combine with a role from a repeated join; membership augments.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Viewer, Self::Viewer) => Self::Viewer,
            (Self::Source, Self::Source) => Self::Source,
            _ => Self::Both,
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Viewer => write!(f, "viewer"),
            Self::Source => write!(f, "source"),
            Self::Both => write!(f, "both"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_predicates() {
        assert!(MemberRole::Viewer.can_view());
        assert!(!MemberRole::Viewer.can_publish());
        assert!(MemberRole::Source.can_publish());
        assert!(!MemberRole::Source.can_view());
        assert!(MemberRole::Both.can_view());
        assert!(MemberRole::Both.can_publish());
    }

    #[test]
    fn test_role_merge() {
        assert_eq!(
            MemberRole::Viewer.merge(MemberRole::Source),
            MemberRole::Both
        );
        assert_eq!(
            MemberRole::Viewer.merge(MemberRole::Viewer),
            MemberRole::Viewer
        );
        assert_eq!(MemberRole::Both.merge(MemberRole::Viewer), MemberRole::Both);
    }

    #[test]
    fn test_random_peer_ids_are_unique() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
