//! Huddle - Matchmaking and Self-Managed Leader Election
//!
//! Clients rendezvous through a matchmaker, which groups them into
//! sessions and hands every member the same ranked roster. From then on
//! the session runs on its own: the leader heartbeats, everyone else
//! watches for silence, and succession follows rank order.
//!
//! # Architecture
//!
//! The matchmaker ([`registry`]) owns session formation and nothing else.
//! Each client owns its view of the session ([`state`]) and drives it from
//! heartbeats and timers ([`peer`]). Election is a pure function of the
//! local alive set, so members agree on the next leader without
//! exchanging votes.
//!
//! # Features
//!
//! - Configurable formation windows and partition policy
//! - Coordination-free succession with epoch-fenced heartbeats
//! - Recursive succession past crashed candidates
//! - Append-only role history with "became leader" / "is a node" markers
//! - Deterministic event stream and virtual-clock friendly core
//! - HTTP status API

pub mod config;
pub mod error;
pub mod protocol;
pub mod network;
pub mod registry;
pub mod state;
pub mod peer;
pub mod api;

pub use config::HuddleConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::HuddleConfig;
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{ClientId, Member, Message, Role, SessionAssignment};
    pub use crate::network::{MemoryTransport, NetworkClient, NetworkServer, Transport};
    pub use crate::registry::{FormationPolicy, SessionRegistry};
    pub use crate::state::{ElectionEngine, MembershipView, RoleHistory};
    pub use crate::peer::{HeartbeatConfig, PeerNode, PeerStatus, Session, SessionEvent};
}
