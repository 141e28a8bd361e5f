//! Role History
//!
//! Append-only log of role transitions for one client. External tooling
//! replays it to find when a client first became leader and to verify it
//! never went back to being a node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{ClientId, Epoch, Role};

/// Why a role was entered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionReason {
    /// Role handed out by the matchmaker's assignment
    InitialAssignment,
    /// Took over after `deposed` was presumed dead
    Succession { deposed: ClientId },
}

/// A single recorded role transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTransition {
    /// Position in the history, starting at 0
    pub seq: u64,
    /// Role entered
    pub role: Role,
    /// Epoch in force when the role was entered
    pub epoch: Epoch,
    /// Leader at that point
    pub leader_id: ClientId,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

impl RoleTransition {
    /// Log marker for this transition
    pub fn marker(&self) -> &'static str {
        match self.role {
            Role::Leader => "became leader",
            Role::Node => "is a node",
        }
    }
}

/// Append-only role transition log
#[derive(Debug, Clone, Default)]
pub struct RoleHistory {
    entries: Vec<RoleTransition>,
}

impl RoleHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition.
    ///
    /// Once a `Leader` entry exists no `Node` entry may follow it.
    pub fn record(
        &mut self,
        role: Role,
        epoch: Epoch,
        leader_id: ClientId,
        reason: TransitionReason,
    ) -> Result<&RoleTransition> {
        if role == Role::Node && self.became_leader().is_some() {
            return Err(Error::Internal("a leader cannot revert to node".into()));
        }
        if self.current() == Some(role) {
            return Err(Error::Internal(format!("already in role {}", role)));
        }

        self.entries.push(RoleTransition {
            seq: self.entries.len() as u64,
            role,
            epoch,
            leader_id,
            reason,
            at: Utc::now(),
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// All transitions, oldest first
    pub fn entries(&self) -> &[RoleTransition] {
        &self.entries
    }

    /// Current role, if any has been recorded
    pub fn current(&self) -> Option<Role> {
        self.entries.last().map(|t| t.role)
    }

    /// First transition into `Leader`
    pub fn became_leader(&self) -> Option<&RoleTransition> {
        self.entries.iter().find(|t| t.role == Role::Leader)
    }

    /// Number of times this client entered `Leader`
    pub fn promotions(&self) -> usize {
        self.entries.iter().filter(|t| t.role == Role::Leader).count()
    }

    /// Whether any `Node` entry follows a `Leader` entry
    pub fn has_reverted(&self) -> bool {
        has_reverted(&self.entries)
    }
}

/// Scan a replayed history for a `Node` entry after a `Leader` entry
pub fn has_reverted(entries: &[RoleTransition]) -> bool {
    entries
        .iter()
        .skip_while(|t| t.role != Role::Leader)
        .any(|t| t.role == Role::Node)
}
