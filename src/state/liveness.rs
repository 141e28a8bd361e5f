//! Liveness Record
//!
//! Per-client record of when each peer was last heard from. Written by
//! the heartbeat subsystem, read by everything else.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::ClientId;

/// Last-contact times keyed by peer
#[derive(Debug, Clone, Default)]
pub struct LivenessRecord {
    last_contact: HashMap<ClientId, Instant>,
}

impl LivenessRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record contact with a peer. Never moves a peer's time backwards.
    pub fn record(&mut self, id: &ClientId, at: Instant) {
        self.last_contact
            .entry(id.clone())
            .and_modify(|last| {
                if at > *last {
                    *last = at;
                }
            })
            .or_insert(at);
    }

    /// When the peer was last heard from
    pub fn last_contact(&self, id: &ClientId) -> Option<Instant> {
        self.last_contact.get(id).copied()
    }

    /// Time since the peer was last heard from
    pub fn silent_for(&self, id: &ClientId, now: Instant) -> Option<Duration> {
        self.last_contact(id).map(|last| now.saturating_duration_since(last))
    }

    /// Whether the peer has been silent longer than `timeout`.
    /// Peers never heard from are not overdue.
    pub fn is_overdue(&self, id: &ClientId, now: Instant, timeout: Duration) -> bool {
        match self.silent_for(id, now) {
            Some(silence) => silence > timeout,
            None => false,
        }
    }
}
