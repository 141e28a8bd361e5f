//! Leader Election
//!
//! Coordination-free succession. The session's rank order is fixed at
//! formation and known to every member, so the next leader is a pure
//! function of the local alive set: no votes are exchanged. A member that
//! computes itself as the successor promotes itself immediately; any other
//! member waits a bounded grace period for the successor's first heartbeat
//! and, failing that, passes over it as well.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{ClientId, Epoch, Role, SessionId};
use crate::state::history::{RoleHistory, TransitionReason};
use crate::state::MembershipView;

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Following a leader (or waiting on a presumptive successor)
    Node,
    /// Emitting heartbeats
    Leader,
    /// Computing a successor. Entered and left within one
    /// `leader_presumed_dead` call, so settled snapshots never carry it;
    /// only a session torn down for lack of candidates is left here.
    Electing,
}

/// A presumptive successor we are waiting to hear from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSuccessor {
    pub candidate: ClientId,
    pub epoch: Epoch,
    /// Grace deadline for the candidate's first heartbeat
    pub deadline: Instant,
}

/// Result of handling a leader failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This client is the new leader
    Promoted { epoch: Epoch, deposed: ClientId },
    /// Another member is the presumptive successor
    Following { candidate: ClientId, epoch: Epoch, deadline: Instant },
    /// The trigger named a peer that is not the current leader
    AlreadyHandled,
}

/// Why a heartbeat was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Heartbeat for a different session
    ForeignSession { session_id: SessionId },
    /// Sender is not a session member
    UnknownSender,
    /// Our own heartbeat looped back
    OwnHeartbeat,
    /// Sender was already presumed dead
    DeadSender,
    /// Epoch is older than ours
    StaleEpoch { received: Epoch, current: Epoch },
    /// Sender claims leadership we do not recognise at this epoch
    ConflictingLeader { epoch: Epoch },
    /// The session has been torn down
    TornDown,
}

/// Result of admitting a heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Accepted {
        /// Leader or epoch changed with this heartbeat
        leader_changed: bool,
        /// Members ranked ahead of the new leader that were marked dead
        passed_over: Vec<ClientId>,
    },
    Ignored(IgnoreReason),
}

/// Per-client election state machine
#[derive(Debug)]
pub struct ElectionEngine {
    /// This client's ID
    local_id: ClientId,
    /// Current state
    state: ElectionState,
    /// Current epoch
    epoch: Epoch,
    /// Current (or presumptive) leader
    leader_id: ClientId,
    /// Successor we are waiting on
    pending: Option<PendingSuccessor>,
    /// Grace period for a successor's first heartbeat
    grace: Duration,
    /// Role transitions
    history: RoleHistory,
}

impl ElectionEngine {
    /// Create the engine from a freshly built view
    pub fn new(view: &MembershipView, leader_id: ClientId, epoch: Epoch, grace: Duration) -> Result<Self> {
        let local_id = view.local_id().clone();
        let (state, role) = if leader_id == local_id {
            (ElectionState::Leader, Role::Leader)
        } else {
            (ElectionState::Node, Role::Node)
        };

        let mut history = RoleHistory::new();
        history.record(role, epoch, leader_id.clone(), TransitionReason::InitialAssignment)?;

        Ok(Self {
            local_id,
            state,
            epoch,
            leader_id,
            pending: None,
            grace,
            history,
        })
    }

    /// Get current state
    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Get current role
    pub fn role(&self) -> Role {
        match self.state {
            ElectionState::Leader => Role::Leader,
            _ => Role::Node,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    /// Get current epoch
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Current (or presumptive) leader
    pub fn leader_id(&self) -> &ClientId {
        &self.leader_id
    }

    /// Successor we are waiting on, if any
    pub fn pending(&self) -> Option<&PendingSuccessor> {
        self.pending.as_ref()
    }

    pub fn history(&self) -> &RoleHistory {
        &self.history
    }

    /// Successor whose grace period has run out
    pub fn successor_overdue(&self, now: Instant) -> Option<&ClientId> {
        self.pending
            .as_ref()
            .filter(|p| now >= p.deadline)
            .map(|p| &p.candidate)
    }

    /// Handle the presumed death of the current (or presumptive) leader.
    ///
    /// Marks `dead` in the view, then picks the lowest-rank alive member
    /// as successor at the next epoch.
    pub fn leader_presumed_dead(
        &mut self,
        view: &mut MembershipView,
        dead: &ClientId,
        now: Instant,
    ) -> Result<ElectionOutcome> {
        if self.state == ElectionState::Leader || dead != &self.leader_id {
            return Ok(ElectionOutcome::AlreadyHandled);
        }

        view.mark_dead(dead)?;
        self.state = ElectionState::Electing;
        let next_epoch = self.epoch + 1;

        let candidate = view
            .next_candidate(dead)
            .map(|m| m.id.clone())
            .ok_or(Error::NoAliveCandidate { session_id: view.session_id() })?;

        tracing::info!(
            "Leader {} presumed dead; successor for epoch {} is {}",
            dead,
            next_epoch,
            candidate
        );

        self.epoch = next_epoch;
        self.leader_id = candidate.clone();

        if candidate == self.local_id {
            self.state = ElectionState::Leader;
            self.pending = None;
            let transition = self.history.record(
                Role::Leader,
                next_epoch,
                candidate,
                TransitionReason::Succession { deposed: dead.clone() },
            )?;
            tracing::info!("{} {} (epoch {})", self.local_id, transition.marker(), next_epoch);

            Ok(ElectionOutcome::Promoted { epoch: next_epoch, deposed: dead.clone() })
        } else {
            let deadline = now + self.grace;
            self.state = ElectionState::Node;
            self.pending = Some(PendingSuccessor {
                candidate: candidate.clone(),
                epoch: next_epoch,
                deadline,
            });

            Ok(ElectionOutcome::Following { candidate, epoch: next_epoch, deadline })
        }
    }

    /// Decide whether a heartbeat is valid and adopt its leader if so.
    ///
    /// A leader never admits another member's heartbeat; leadership ends
    /// only with the process.
    pub fn admit_heartbeat(
        &mut self,
        view: &mut MembershipView,
        session_id: SessionId,
        epoch: Epoch,
        sender: &ClientId,
    ) -> HeartbeatVerdict {
        if session_id != view.session_id() {
            return HeartbeatVerdict::Ignored(IgnoreReason::ForeignSession { session_id });
        }
        let Some(sender_rank) = view.rank_of(sender) else {
            return HeartbeatVerdict::Ignored(IgnoreReason::UnknownSender);
        };
        if sender == &self.local_id {
            return HeartbeatVerdict::Ignored(IgnoreReason::OwnHeartbeat);
        }
        if !view.is_alive(sender) {
            return HeartbeatVerdict::Ignored(IgnoreReason::DeadSender);
        }
        if epoch < self.epoch {
            return HeartbeatVerdict::Ignored(IgnoreReason::StaleEpoch {
                received: epoch,
                current: self.epoch,
            });
        }
        if self.state == ElectionState::Leader || (epoch == self.epoch && sender != &self.leader_id) {
            return HeartbeatVerdict::Ignored(IgnoreReason::ConflictingLeader { epoch });
        }

        let leader_changed = epoch > self.epoch || sender != &self.leader_id;
        let passed_over = if epoch > self.epoch {
            view.mark_dead_before(sender_rank)
        } else {
            Vec::new()
        };

        self.epoch = epoch;
        self.leader_id = sender.clone();
        self.pending = None;
        self.state = ElectionState::Node;

        HeartbeatVerdict::Accepted { leader_changed, passed_over }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Member, SessionAssignment};

    const GRACE: Duration = Duration::from_millis(1000);

    fn assignment(ids: &[&str]) -> SessionAssignment {
        SessionAssignment {
            session_id: 9,
            members: ids
                .iter()
                .enumerate()
                .map(|(rank, id)| Member {
                    id: ClientId::from(*id),
                    address: format!("mem://{}", id),
                    rank: rank as u32,
                })
                .collect(),
            leader_id: ClientId::from(ids[0]),
            epoch: 0,
        }
    }

    fn setup(local: &str, ids: &[&str]) -> (MembershipView, ElectionEngine) {
        let a = assignment(ids);
        let view = MembershipView::from_assignment(&local.into(), &a).unwrap();
        let engine = ElectionEngine::new(&view, a.leader_id.clone(), a.epoch, GRACE).unwrap();
        (view, engine)
    }

    #[test]
    fn test_election_settles_in_one_step() {
        let now = Instant::now();

        let (mut view, mut successor) = setup("c2", &["c1", "c2", "c3"]);
        successor.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(successor.state(), ElectionState::Leader);

        let (mut view, mut follower) = setup("c3", &["c1", "c2", "c3"]);
        follower.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(follower.state(), ElectionState::Node);
        assert!(follower.pending().is_some());
    }

    #[test]
    fn test_initial_roles() {
        let (_, leader) = setup("c1", &["c1", "c2", "c3"]);
        assert_eq!(leader.state(), ElectionState::Leader);
        assert_eq!(leader.history().entries()[0].marker(), "became leader");

        let (_, node) = setup("c2", &["c1", "c2", "c3"]);
        assert_eq!(node.role(), Role::Node);
        assert_eq!(node.epoch(), 0);
        assert_eq!(node.history().entries()[0].marker(), "is a node");
    }

    #[test]
    fn test_successor_promotes_itself() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c2", &["c1", "c2", "c3"]);

        let outcome = engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(outcome, ElectionOutcome::Promoted { epoch: 1, deposed: "c1".into() });
        assert!(engine.is_leader());
        assert_eq!(engine.leader_id().as_str(), "c2");
        assert!(!view.is_alive(&"c1".into()));
        assert_eq!(engine.history().promotions(), 1);
    }

    #[test]
    fn test_non_successor_waits_for_candidate() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c3", &["c1", "c2", "c3"]);

        let outcome = engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(
            outcome,
            ElectionOutcome::Following { candidate: "c2".into(), epoch: 1, deadline: now + GRACE }
        );
        assert_eq!(engine.role(), Role::Node);
        assert!(engine.successor_overdue(now).is_none());
        assert_eq!(engine.successor_overdue(now + GRACE).unwrap().as_str(), "c2");

        // Candidate's heartbeat at the new epoch clears the grace timer
        let verdict = engine.admit_heartbeat(&mut view, 9, 1, &"c2".into());
        assert_eq!(verdict, HeartbeatVerdict::Accepted { leader_changed: false, passed_over: vec![] });
        assert!(engine.pending().is_none());
        assert_eq!(engine.history().entries().len(), 1);
    }

    #[test]
    fn test_recursive_succession() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c3", &["c1", "c2", "c3"]);

        engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        let overdue = engine.successor_overdue(now + GRACE).cloned().unwrap();
        let outcome = engine.leader_presumed_dead(&mut view, &overdue, now + GRACE).unwrap();

        assert_eq!(outcome, ElectionOutcome::Promoted { epoch: 2, deposed: "c2".into() });
        assert!(engine.is_leader());
    }

    #[test]
    fn test_trigger_for_non_leader_is_noop() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c2", &["c1", "c2", "c3"]);

        let outcome = engine.leader_presumed_dead(&mut view, &"c3".into(), now).unwrap();
        assert_eq!(outcome, ElectionOutcome::AlreadyHandled);
        assert!(view.is_alive(&"c3".into()));

        engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        let again = engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(again, ElectionOutcome::AlreadyHandled);
        assert_eq!(engine.epoch(), 1);
    }

    #[test]
    fn test_last_survivor_leads() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c2", &["c1", "c2"]);
        let outcome = engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(outcome, ElectionOutcome::Promoted { epoch: 1, deposed: "c1".into() });
        assert_eq!(view.alive_set().len(), 1);
    }

    #[test]
    fn test_stale_and_duplicate_heartbeats() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c3", &["c1", "c2", "c3", "c4"]);

        engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        assert_eq!(engine.admit_heartbeat(&mut view, 9, 1, &"c2".into()), HeartbeatVerdict::Accepted {
            leader_changed: false,
            passed_over: vec![],
        });

        // Replaying the same heartbeat changes nothing
        assert!(matches!(engine.admit_heartbeat(&mut view, 9, 1, &"c2".into()), HeartbeatVerdict::Accepted { .. }));
        assert_eq!(engine.epoch(), 1);
        assert_eq!(engine.leader_id().as_str(), "c2");

        // A delayed heartbeat from the deposed leader is ignored
        assert_eq!(
            engine.admit_heartbeat(&mut view, 9, 0, &"c1".into()),
            HeartbeatVerdict::Ignored(IgnoreReason::DeadSender)
        );
        // An older epoch from a live member is stale
        assert_eq!(
            engine.admit_heartbeat(&mut view, 9, 0, &"c4".into()),
            HeartbeatVerdict::Ignored(IgnoreReason::StaleEpoch { received: 0, current: 1 })
        );
        // Same epoch, different leader
        assert_eq!(
            engine.admit_heartbeat(&mut view, 9, 1, &"c4".into()),
            HeartbeatVerdict::Ignored(IgnoreReason::ConflictingLeader { epoch: 1 })
        );
    }

    #[test]
    fn test_rejects_unknown_and_foreign() {
        let (mut view, mut engine) = setup("c2", &["c1", "c2"]);
        assert_eq!(
            engine.admit_heartbeat(&mut view, 4, 0, &"c1".into()),
            HeartbeatVerdict::Ignored(IgnoreReason::ForeignSession { session_id: 4 })
        );
        assert_eq!(
            engine.admit_heartbeat(&mut view, 9, 0, &"zz".into()),
            HeartbeatVerdict::Ignored(IgnoreReason::UnknownSender)
        );
        assert_eq!(
            engine.admit_heartbeat(&mut view, 9, 0, &"c2".into()),
            HeartbeatVerdict::Ignored(IgnoreReason::OwnHeartbeat)
        );
    }

    #[test]
    fn test_higher_epoch_leader_passes_over_lower_ranks() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c4", &["c1", "c2", "c3", "c4"]);

        engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();
        // c3 already gave up on c2 and took over at epoch 2
        let verdict = engine.admit_heartbeat(&mut view, 9, 2, &"c3".into());
        assert_eq!(verdict, HeartbeatVerdict::Accepted {
            leader_changed: true,
            passed_over: vec!["c2".into()],
        });
        assert!(engine.pending().is_none());
        assert_eq!(engine.leader_id().as_str(), "c3");
        assert!(!view.is_alive(&"c2".into()));
    }

    #[test]
    fn test_leader_never_reverts() {
        let now = Instant::now();
        let (mut view, mut engine) = setup("c2", &["c1", "c2", "c3"]);
        engine.leader_presumed_dead(&mut view, &"c1".into(), now).unwrap();

        let verdict = engine.admit_heartbeat(&mut view, 9, 5, &"c3".into());
        assert_eq!(verdict, HeartbeatVerdict::Ignored(IgnoreReason::ConflictingLeader { epoch: 5 }));
        assert!(engine.is_leader());
        assert!(!engine.history().has_reverted());

        // Leaders do not run elections
        assert_eq!(
            engine.leader_presumed_dead(&mut view, &"c2".into(), now).unwrap(),
            ElectionOutcome::AlreadyHandled
        );
    }
}
