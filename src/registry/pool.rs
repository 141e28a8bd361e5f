//! Pending Pool
//!
//! Registrations waiting for the next formation window, and the policy
//! that turns them into sessions. Time is passed in by the caller.

use std::collections::HashMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{LateRegistration, MatchmakerConfig, PartitionPolicy, WindowAnchor};
use crate::error::{Error, Result};
use crate::protocol::{ClientId, Member, SessionAssignment, SessionId};

/// Formation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormationPolicy {
    pub window: Duration,
    pub anchor: WindowAnchor,
    pub min_size: usize,
    pub max_size: Option<usize>,
    pub partition: PartitionPolicy,
    pub late_registration: LateRegistration,
}

impl From<&MatchmakerConfig> for FormationPolicy {
    fn from(config: &MatchmakerConfig) -> Self {
        Self {
            window: config.formation_window(),
            anchor: config.window_anchor,
            min_size: config.min_session_size,
            max_size: config.max_session_size,
            partition: config.partition,
            late_registration: config.late_registration,
        }
    }
}

/// A registered client waiting for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingClient {
    pub id: ClientId,
    pub address: String,
    pub registered_at: DateTime<Utc>,
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Added to the pool
    Queued { pending: usize },
    /// Already pending from the same address
    AlreadyPending { pending: usize },
    /// Already placed in a formed session; not queued again
    AlreadySeated { session_id: SessionId, pending: usize },
}

impl RegistrationOutcome {
    pub fn pending(&self) -> usize {
        match self {
            RegistrationOutcome::Queued { pending }
            | RegistrationOutcome::AlreadyPending { pending }
            | RegistrationOutcome::AlreadySeated { pending, .. } => *pending,
        }
    }
}

/// Members of a session about to be dispatched, in rank order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    pub session_id: SessionId,
    pub members: Vec<PendingClient>,
}

impl SessionPlan {
    /// Roster message: ranks in registration order, rank 0 leads, epoch 0
    pub fn to_assignment(&self) -> SessionAssignment {
        let members: Vec<Member> = self
            .members
            .iter()
            .enumerate()
            .map(|(rank, client)| Member {
                id: client.id.clone(),
                address: client.address.clone(),
                rank: rank as u32,
            })
            .collect();

        SessionAssignment {
            session_id: self.session_id,
            leader_id: members[0].id.clone(),
            members,
            epoch: 0,
        }
    }
}

/// What one window closure produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormationReport {
    pub sessions: Vec<SessionPlan>,
    /// Still pending for the next window
    pub deferred: Vec<ClientId>,
    /// Dropped because the registry closed
    pub stranded: Vec<PendingClient>,
}

/// Registration pool with its window clock
#[derive(Debug)]
pub struct PendingPool {
    policy: FormationPolicy,
    pending: Vec<PendingClient>,
    /// Clients placed in a formed session: id -> (session, address)
    seated: HashMap<ClientId, (SessionId, String)>,
    window_opened: Option<Instant>,
    next_session_id: SessionId,
    closed: bool,
}

impl PendingPool {
    /// Create a pool. With a startup anchor the first window opens at `now`.
    pub fn new(policy: FormationPolicy, now: Instant) -> Self {
        let window_opened = match policy.anchor {
            WindowAnchor::Startup => Some(now),
            WindowAnchor::FirstRegistration => None,
        };
        Self {
            policy,
            pending: Vec::new(),
            seated: HashMap::new(),
            window_opened,
            next_session_id: 1,
            closed: false,
        }
    }

    pub fn policy(&self) -> &FormationPolicy {
        &self.policy
    }

    /// Add a client to the pool
    pub fn register(&mut self, id: ClientId, address: String, now: Instant) -> Result<RegistrationOutcome> {
        if let Some((session_id, seated_address)) = self.seated.get(&id) {
            if *seated_address == address {
                return Ok(RegistrationOutcome::AlreadySeated {
                    session_id: *session_id,
                    pending: self.pending.len(),
                });
            }
            return Err(Error::DuplicateRegistration {
                client_id: id.to_string(),
                address: seated_address.clone(),
            });
        }

        if self.closed {
            return Err(Error::RegistrationAfterClose {
                reason: "session formation has completed and late registration is rejected".into(),
            });
        }

        if let Some(existing) = self.pending.iter().find(|c| c.id == id) {
            if existing.address == address {
                return Ok(RegistrationOutcome::AlreadyPending { pending: self.pending.len() });
            }
            return Err(Error::DuplicateRegistration {
                client_id: id.to_string(),
                address: existing.address.clone(),
            });
        }

        if self.window_opened.is_none() {
            self.window_opened = Some(now);
        }

        self.pending.push(PendingClient {
            id,
            address,
            registered_at: Utc::now(),
        });
        Ok(RegistrationOutcome::Queued { pending: self.pending.len() })
    }

    /// Session a client was placed in
    pub fn seated_in(&self, id: &ClientId) -> Option<SessionId> {
        self.seated.get(id).map(|(session_id, _)| *session_id)
    }

    /// Clients waiting, in registration order
    pub fn pending(&self) -> &[PendingClient] {
        &self.pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the pool reached the maximum session size
    pub fn is_full(&self) -> bool {
        !self.closed
            && self
                .policy
                .max_size
                .map(|max| self.pending.len() >= max)
                .unwrap_or(false)
    }

    /// When the current window closes
    pub fn window_deadline(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        self.window_opened.map(|opened| opened + self.policy.window)
    }

    /// Close the window: partition the pool and re-arm or close.
    pub fn form_sessions(&mut self, now: Instant) -> FormationReport {
        let mut report = FormationReport::default();
        if self.closed {
            return report;
        }

        let chunk_size = self.policy.max_size.unwrap_or(usize::MAX).max(1);
        let mut remaining = std::mem::take(&mut self.pending);

        while remaining.len() >= self.policy.min_size && !remaining.is_empty() {
            let take = remaining.len().min(chunk_size);
            let rest = remaining.split_off(take);
            for client in &remaining {
                self.seated.insert(client.id.clone(), (self.next_session_id, client.address.clone()));
            }
            report.sessions.push(SessionPlan {
                session_id: self.next_session_id,
                members: remaining,
            });
            self.next_session_id += 1;
            remaining = rest;

            if self.policy.partition == PartitionPolicy::AllPending {
                break;
            }
        }

        if self.policy.late_registration == LateRegistration::Reject && !report.sessions.is_empty() {
            self.closed = true;
            self.window_opened = None;
            report.stranded = remaining;
            return report;
        }

        report.deferred = remaining.iter().map(|c| c.id.clone()).collect();
        self.pending = remaining;
        self.window_opened = if !self.pending.is_empty() || self.policy.anchor == WindowAnchor::Startup {
            Some(now)
        } else {
            None
        };
        report
    }
}
