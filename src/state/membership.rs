//! Session Membership View
//!
//! The ordered roster of a session as seen by one client. Membership and
//! rank are frozen at formation time; only the per-member alive flag
//! changes, and only from alive to dead.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::protocol::{ClientId, Member, SessionAssignment, SessionId};

/// Ordered, read-mostly view of a session's members
#[derive(Debug, Clone)]
pub struct MembershipView {
    /// Session this view belongs to
    session_id: SessionId,
    /// This client's ID
    local_id: ClientId,
    /// Members indexed by rank
    members: Vec<Member>,
    /// Dead flag per rank
    dead: Vec<bool>,
}

impl MembershipView {
    /// Build the view from the matchmaker's assignment.
    ///
    /// The assignment must list each client once, with ranks forming
    /// `0..N`, name a leader that is a member, and include `local_id`.
    pub fn from_assignment(local_id: &ClientId, assignment: &SessionAssignment) -> Result<Self> {
        if assignment.members.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "session {} has no members",
                assignment.session_id
            )));
        }

        let mut members = assignment.members.clone();
        members.sort_by_key(|m| m.rank);

        let mut seen = HashSet::new();
        for (index, member) in members.iter().enumerate() {
            if member.rank as usize != index {
                return Err(Error::MalformedMessage(format!(
                    "session {} ranks are not contiguous (expected {}, found {})",
                    assignment.session_id, index, member.rank
                )));
            }
            if !seen.insert(&member.id) {
                return Err(Error::MalformedMessage(format!(
                    "session {} lists {} more than once",
                    assignment.session_id, member.id
                )));
            }
        }

        if !seen.contains(&assignment.leader_id) {
            return Err(Error::MalformedMessage(format!(
                "session {} leader {} is not a member",
                assignment.session_id, assignment.leader_id
            )));
        }

        if !seen.contains(local_id) {
            return Err(Error::NotInSession(local_id.to_string()));
        }

        let dead = vec![false; members.len()];
        Ok(Self {
            session_id: assignment.session_id,
            local_id: local_id.clone(),
            members,
            dead,
        })
    }

    /// Get the session ID
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Get this client's ID
    pub fn local_id(&self) -> &ClientId {
        &self.local_id
    }

    /// Get this client's rank
    pub fn local_rank(&self) -> u32 {
        self.rank_of(&self.local_id).unwrap_or_default()
    }

    /// Number of members, dead or alive
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All members in rank order
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Look up a member
    pub fn member(&self, id: &ClientId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }

    /// Rank of a member
    pub fn rank_of(&self, id: &ClientId) -> Option<u32> {
        self.member(id).map(|m| m.rank)
    }

    /// Whether a member is still considered alive (unknown IDs are not)
    pub fn is_alive(&self, id: &ClientId) -> bool {
        self.rank_of(id)
            .map(|rank| !self.dead[rank as usize])
            .unwrap_or(false)
    }

    /// Members not yet marked dead, in rank order
    pub fn alive_set(&self) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|m| !self.dead[m.rank as usize])
            .collect()
    }

    /// Alive members other than this client
    pub fn alive_peers(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(move |m| !self.dead[m.rank as usize] && m.id != self.local_id)
    }

    /// Members marked dead, in rank order
    pub fn dead_members(&self) -> Vec<&ClientId> {
        self.members
            .iter()
            .filter(|m| self.dead[m.rank as usize])
            .map(|m| &m.id)
            .collect()
    }

    /// Mark a peer dead. Returns `true` if it was alive until now.
    ///
    /// This client never marks itself dead; its own death is only
    /// observable by others.
    pub fn mark_dead(&mut self, id: &ClientId) -> Result<bool> {
        if id == &self.local_id {
            return Err(Error::Internal(format!("{} cannot mark itself dead", id)));
        }
        let rank = self
            .rank_of(id)
            .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
        let slot = &mut self.dead[rank as usize];
        let newly_dead = !*slot;
        *slot = true;
        Ok(newly_dead)
    }

    /// Mark every peer ranked ahead of `rank` dead, returning those newly marked
    pub fn mark_dead_before(&mut self, rank: u32) -> Vec<ClientId> {
        let mut marked = Vec::new();
        for member in self.members.iter().take(rank as usize) {
            if member.id == self.local_id {
                continue;
            }
            let slot = &mut self.dead[member.rank as usize];
            if !*slot {
                *slot = true;
                marked.push(member.id.clone());
            }
        }
        marked
    }

    /// Lowest-rank alive member other than `dead_id`.
    ///
    /// Pure function of the alive set, so every member holding the same
    /// alive set computes the same candidate.
    pub fn next_candidate(&self, dead_id: &ClientId) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| !self.dead[m.rank as usize] && &m.id != dead_id)
    }
}
