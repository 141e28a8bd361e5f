//! Wire Protocol
//!
//! Messages exchanged between clients and the matchmaker, and between
//! the members of a session.

use serde::{Deserialize, Serialize};

use crate::peer::PeerStatus;

/// Session identifier, assigned by the matchmaker
pub type SessionId = u64;

/// Leadership term counter within a session
pub type Epoch = u64;

/// Stable client identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier
    pub fn generate() -> Self {
        Self(format!("client-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A session member as dispatched by the matchmaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Client identity
    pub id: ClientId,
    /// Address the client listens on (host:port)
    pub address: String,
    /// Position in the session's total order (0 = first in line)
    pub rank: u32,
}

/// Role of a client within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Regular member following the leader
    Node,
    /// Session leader, emitting heartbeats
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Node => f.pad("NODE"),
            Role::Leader => f.pad("LEADER"),
        }
    }
}

/// Roster sent to every member when a session forms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAssignment {
    pub session_id: SessionId,
    /// Members ordered by rank
    pub members: Vec<Member>,
    /// Initial leader (rank 0)
    pub leader_id: ClientId,
    pub epoch: Epoch,
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Registration ==========
    /// Register with the matchmaker
    Register {
        client_id: ClientId,
        address: String,
    },

    /// Matchmaker answer to a registration
    RegisterResponse {
        accepted: bool,
        reason: Option<String>,
        /// Clients pending in the pool after this registration
        pending: usize,
    },

    // ========== Session ==========
    /// Roster and order, sent once by the matchmaker
    SessionAssignment(SessionAssignment),

    /// Liveness signal from the current leader
    Heartbeat {
        session_id: SessionId,
        epoch: Epoch,
        leader_id: ClientId,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse(PeerStatus),

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The receiver does not handle this message type
    UnexpectedMessage,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "Register",
            Message::RegisterResponse { .. } => "RegisterResponse",
            Message::SessionAssignment(_) => "SessionAssignment",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse(_) => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from the wire
    pub const MAX_LENGTH: u32 = 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Check the body against this header
    pub fn verify(&self, body: &[u8]) -> bool {
        body.len() == self.length as usize && crc32fast::hash(body) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Heartbeat {
            session_id: 3,
            epoch: 2,
            leader_id: ClientId::new("p1"),
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::Heartbeat { session_id, epoch, leader_id } => {
                assert_eq!(session_id, 3);
                assert_eq!(epoch, 2);
                assert_eq!(leader_id.as_str(), "p1");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_garbage_does_not_deserialize() {
        assert!(Message::deserialize(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
        assert!(restored.verify(data));
        assert!(!restored.verify(b"test message dat4"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client-"));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Leader.to_string(), "LEADER");
        assert_eq!(Role::Node.to_string(), "NODE");
    }
}
