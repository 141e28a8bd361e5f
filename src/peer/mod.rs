//! Session Client
//!
//! Client-side half of the protocol: heartbeat emission and failure
//! detection, the per-session state machine, and the async runtime that
//! connects both to the network.

pub mod heartbeat;
mod session;
mod node;

pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use session::{PeerStatus, Session, SessionEvent};
pub use node::PeerNode;
