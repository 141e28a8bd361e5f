//! Session State Machine
//!
//! Everything one client knows about its session, driven purely by
//! inbound heartbeats and timer ticks with an explicit `now`. No I/O
//! happens here: outbound heartbeats are returned as `(address, message)`
//! pairs and every notable step is queued as a [`SessionEvent`].

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::error::{Error, Result};
use crate::protocol::{ClientId, Epoch, Message, Role, SessionAssignment, SessionId};
use crate::state::{
    ElectionEngine, ElectionOutcome, ElectionState, HeartbeatVerdict, IgnoreReason, LivenessRecord,
    MembershipView, RoleHistory, RoleTransition,
};

/// Observable session events, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Roster received from the matchmaker
    Assigned {
        session_id: SessionId,
        rank: u32,
        leader_id: ClientId,
        role: Role,
    },
    /// Leader silent past the timeout
    LeaderSuspected { leader_id: ClientId, silent_ms: u64 },
    /// Presumptive successor never sent a heartbeat within the grace period
    SuccessorOverdue { candidate: ClientId },
    /// This client took over leadership
    Promoted { epoch: Epoch, deposed: ClientId },
    /// Waiting on another member to take over
    Following { candidate: ClientId, epoch: Epoch },
    /// A heartbeat established a new leader or epoch
    LeaderConfirmed {
        leader_id: ClientId,
        epoch: Epoch,
        passed_over: Vec<ClientId>,
    },
    /// A heartbeat was dropped
    HeartbeatIgnored { from: ClientId, reason: IgnoreReason },
    /// The session has no viable leader
    TornDown { reason: String },
}

/// Snapshot of a client's status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub client_id: ClientId,
    pub session_id: Option<SessionId>,
    pub rank: Option<u32>,
    pub role: Option<Role>,
    /// `Node` or `Leader` once settled; `Electing` only on teardown
    pub election_state: Option<ElectionState>,
    pub epoch: Option<Epoch>,
    pub leader_id: Option<ClientId>,
    pub alive: Vec<ClientId>,
    pub torn_down: bool,
    /// Role transitions, oldest first
    pub history: Vec<RoleTransition>,
}

impl PeerStatus {
    /// Status of a client that has not been assigned to a session yet
    pub fn unassigned(client_id: ClientId) -> Self {
        Self {
            client_id,
            session_id: None,
            rank: None,
            role: None,
            election_state: None,
            epoch: None,
            leader_id: None,
            alive: Vec::new(),
            torn_down: false,
            history: Vec::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Some(Role::Leader)
    }
}

/// One client's session: membership, liveness, heartbeat and election
#[derive(Debug)]
pub struct Session {
    view: MembershipView,
    liveness: LivenessRecord,
    heartbeat: HeartbeatMonitor,
    engine: ElectionEngine,
    torn_down: Option<String>,
    events: Vec<SessionEvent>,
}

impl Session {
    /// Build the session from the matchmaker's assignment
    pub fn from_assignment(
        local_id: &ClientId,
        assignment: &SessionAssignment,
        config: HeartbeatConfig,
        now: Instant,
    ) -> Result<Self> {
        let view = MembershipView::from_assignment(local_id, assignment)?;
        let engine = ElectionEngine::new(&view, assignment.leader_id.clone(), assignment.epoch, config.grace)?;

        let mut liveness = LivenessRecord::new();
        let mut heartbeat = HeartbeatMonitor::new(config);
        if engine.is_leader() {
            heartbeat.start_emitting(now);
        } else {
            // The leader gets a full timeout from the moment we learn of it
            heartbeat.record(&mut liveness, &assignment.leader_id, now);
        }

        let role = engine.role();
        let rank = view.local_rank();
        tracing::info!(
            "Joined session {} as rank {} of {}; {} {}",
            view.session_id(),
            rank,
            view.len(),
            local_id,
            engine.history().entries()[0].marker()
        );

        Ok(Self {
            events: vec![SessionEvent::Assigned {
                session_id: view.session_id(),
                rank,
                leader_id: assignment.leader_id.clone(),
                role,
            }],
            view,
            liveness,
            heartbeat,
            engine,
            torn_down: None,
        })
    }

    pub fn view(&self) -> &MembershipView {
        &self.view
    }

    pub fn liveness(&self) -> &LivenessRecord {
        &self.liveness
    }

    pub fn role(&self) -> Role {
        self.engine.role()
    }

    pub fn epoch(&self) -> Epoch {
        self.engine.epoch()
    }

    pub fn leader_id(&self) -> &ClientId {
        self.engine.leader_id()
    }

    pub fn history(&self) -> &RoleHistory {
        self.engine.history()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.is_some()
    }

    /// Take the events queued since the last drain
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Snapshot for status queries
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            client_id: self.view.local_id().clone(),
            session_id: Some(self.view.session_id()),
            rank: Some(self.view.local_rank()),
            role: Some(self.role()),
            election_state: Some(self.engine.state()),
            epoch: Some(self.epoch()),
            leader_id: Some(self.leader_id().clone()),
            alive: self.view.alive_set().into_iter().map(|m| m.id.clone()).collect(),
            torn_down: self.is_torn_down(),
            history: self.history().entries().to_vec(),
        }
    }

    /// Handle an inbound heartbeat
    pub fn handle_heartbeat(
        &mut self,
        session_id: SessionId,
        epoch: Epoch,
        sender: &ClientId,
        now: Instant,
    ) -> HeartbeatVerdict {
        if self.is_torn_down() {
            return HeartbeatVerdict::Ignored(IgnoreReason::TornDown);
        }

        let verdict = self.engine.admit_heartbeat(&mut self.view, session_id, epoch, sender);
        match &verdict {
            HeartbeatVerdict::Accepted { leader_changed, passed_over } => {
                self.heartbeat.record(&mut self.liveness, sender, now);
                if *leader_changed || !passed_over.is_empty() {
                    tracing::info!("Following leader {} at epoch {}", sender, epoch);
                    self.events.push(SessionEvent::LeaderConfirmed {
                        leader_id: sender.clone(),
                        epoch,
                        passed_over: passed_over.clone(),
                    });
                }
            }
            HeartbeatVerdict::Ignored(reason) => {
                match reason {
                    IgnoreReason::StaleEpoch { received, current } => {
                        let err = Error::StaleEpoch { received: *received, current: *current };
                        tracing::debug!("Ignoring heartbeat from {}: {}", sender, err)
                    }
                    IgnoreReason::ConflictingLeader { .. } => {
                        tracing::warn!("Ignoring heartbeat from {}: {:?}", sender, reason)
                    }
                    _ => tracing::debug!("Ignoring heartbeat from {}: {:?}", sender, reason),
                }
                self.events.push(SessionEvent::HeartbeatIgnored {
                    from: sender.clone(),
                    reason: reason.clone(),
                });
            }
        }
        verdict
    }

    /// Advance timers. Returns heartbeats to send.
    ///
    /// Fails with `NoAliveCandidate` if succession runs out of members, in
    /// which case the session is torn down and later ticks do nothing.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<(String, Message)>> {
        if self.is_torn_down() {
            return Ok(Vec::new());
        }

        if self.engine.is_leader() {
            return Ok(self.due_heartbeats(now));
        }

        let suspect = if let Some(candidate) = self.engine.successor_overdue(now).cloned() {
            tracing::warn!("Successor {} sent no heartbeat within the grace period", candidate);
            self.events.push(SessionEvent::SuccessorOverdue { candidate: candidate.clone() });
            Some(candidate)
        } else if self.engine.pending().is_none()
            && self.heartbeat.leader_overdue(&self.liveness, self.engine.leader_id(), now)
        {
            let leader = self.engine.leader_id().clone();
            let silent_ms = self
                .liveness
                .silent_for(&leader, now)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            tracing::warn!("Leader {} silent for {}ms", leader, silent_ms);
            self.events.push(SessionEvent::LeaderSuspected { leader_id: leader.clone(), silent_ms });
            Some(leader)
        } else {
            None
        };

        let Some(dead) = suspect else {
            return Ok(Vec::new());
        };

        match self.engine.leader_presumed_dead(&mut self.view, &dead, now) {
            Ok(ElectionOutcome::Promoted { epoch, deposed }) => {
                self.events.push(SessionEvent::Promoted { epoch, deposed });
                self.heartbeat.start_emitting(now);
                Ok(self.due_heartbeats(now))
            }
            Ok(ElectionOutcome::Following { candidate, epoch, .. }) => {
                tracing::info!("{} is a node, awaiting {} at epoch {}", self.view.local_id(), candidate, epoch);
                self.events.push(SessionEvent::Following { candidate, epoch });
                Ok(Vec::new())
            }
            Ok(ElectionOutcome::AlreadyHandled) => Ok(Vec::new()),
            Err(e) => {
                if e.is_fatal_for_session() {
                    self.tear_down(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Stop all session activity for good
    pub fn tear_down(&mut self, reason: impl Into<String>) {
        if self.torn_down.is_some() {
            return;
        }
        let reason = reason.into();
        tracing::error!("Session {} torn down: {}", self.view.session_id(), reason);
        self.events.push(SessionEvent::TornDown { reason: reason.clone() });
        self.torn_down = Some(reason);
    }

    fn due_heartbeats(&mut self, now: Instant) -> Vec<(String, Message)> {
        if self.heartbeat.emit_due(now) {
            self.heartbeat.heartbeats(&self.view, self.engine.epoch())
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Member;
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout_multiplier: 3,
            grace: Duration::from_millis(500),
        }
    }

    fn assignment(ids: &[&str]) -> SessionAssignment {
        SessionAssignment {
            session_id: 1,
            members: ids
                .iter()
                .enumerate()
                .map(|(rank, id)| Member {
                    id: ClientId::from(*id),
                    address: id.to_string(),
                    rank: rank as u32,
                })
                .collect(),
            leader_id: ClientId::from(ids[0]),
            epoch: 0,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_leader_emits_immediately_and_periodically() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c1".into(), &assignment(&["c1", "c2", "c3"]), config(), start).unwrap();

        let first = session.tick(start).unwrap();
        let targets: Vec<_> = first.iter().map(|(addr, _)| addr.as_str()).collect();
        assert_eq!(targets, vec!["c2", "c3"]);

        assert!(session.tick(start + ms(50)).unwrap().is_empty());
        assert_eq!(session.tick(start + ms(100)).unwrap().len(), 2);
    }

    #[test]
    fn test_heartbeats_keep_leader_alive() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c2".into(), &assignment(&["c1", "c2", "c3"]), config(), start).unwrap();

        for step in 1..=10 {
            let now = start + ms(step * 100);
            session.handle_heartbeat(1, 0, &"c1".into(), now);
            assert!(session.tick(now).unwrap().is_empty());
        }
        assert_eq!(session.role(), Role::Node);
        assert_eq!(session.epoch(), 0);
    }

    #[test]
    fn test_successor_takes_over_after_timeout() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c2".into(), &assignment(&["c1", "c2", "c3"]), config(), start).unwrap();
        session.drain_events();

        assert!(session.tick(start + ms(300)).unwrap().is_empty());
        let out = session.tick(start + ms(301)).unwrap();

        assert_eq!(session.role(), Role::Leader);
        assert_eq!(session.epoch(), 1);
        // The dead leader gets no heartbeat
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "c3");

        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::LeaderSuspected { .. }));
        assert_eq!(events[1], SessionEvent::Promoted { epoch: 1, deposed: "c1".into() });
    }

    #[test]
    fn test_follower_of_successor_stays_node() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c3".into(), &assignment(&["c1", "c2", "c3"]), config(), start).unwrap();

        session.tick(start + ms(301)).unwrap();
        assert_eq!(session.role(), Role::Node);
        assert_eq!(session.leader_id().as_str(), "c2");

        let verdict = session.handle_heartbeat(1, 1, &"c2".into(), start + ms(350));
        assert!(matches!(verdict, HeartbeatVerdict::Accepted { .. }));

        // Well past the grace deadline, but c2 keeps heartbeating
        for step in 4..20 {
            let now = start + ms(step * 100);
            session.handle_heartbeat(1, 1, &"c2".into(), now);
            session.tick(now).unwrap();
        }
        assert_eq!(session.role(), Role::Node);
        assert_eq!(session.history().entries().len(), 1);
    }

    #[test]
    fn test_grace_expiry_recurses() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c3".into(), &assignment(&["c1", "c2", "c3"]), config(), start).unwrap();

        session.tick(start + ms(301)).unwrap();
        assert!(session.tick(start + ms(700)).unwrap().is_empty());
        let out = session.tick(start + ms(801)).unwrap();

        assert_eq!(session.role(), Role::Leader);
        assert_eq!(session.epoch(), 2);
        assert!(out.is_empty(), "no live peers left to notify");

        let events = session.drain_events();
        assert!(events.contains(&SessionEvent::SuccessorOverdue { candidate: "c2".into() }));
        assert!(events.contains(&SessionEvent::Promoted { epoch: 2, deposed: "c2".into() }));
    }

    #[test]
    fn test_stale_replay_has_no_effect() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c3".into(), &assignment(&["c1", "c2", "c3", "c4"]), config(), start).unwrap();

        session.tick(start + ms(301)).unwrap();
        session.handle_heartbeat(1, 1, &"c2".into(), start + ms(400));
        let last = session.liveness().last_contact(&"c2".into());

        let verdict = session.handle_heartbeat(1, 0, &"c4".into(), start + ms(450));
        assert!(matches!(verdict, HeartbeatVerdict::Ignored(IgnoreReason::StaleEpoch { .. })));
        assert_eq!(session.liveness().last_contact(&"c2".into()), last);
        assert!(session.liveness().last_contact(&"c4".into()).is_none());
        assert_eq!(session.epoch(), 1);
    }

    #[test]
    fn test_status_snapshot() {
        let start = Instant::now();
        let session = Session::from_assignment(&"c2".into(), &assignment(&["c1", "c2"]), config(), start).unwrap();
        let status = session.status();
        assert_eq!(status.session_id, Some(1));
        assert_eq!(status.rank, Some(1));
        assert_eq!(status.role, Some(Role::Node));
        assert_eq!(status.leader_id, Some("c1".into()));
        assert_eq!(status.alive.len(), 2);
        assert_eq!(status.history.len(), 1);
        assert!(!status.is_leader());
    }

    #[test]
    fn test_tear_down_stops_activity() {
        let start = Instant::now();
        let mut session = Session::from_assignment(&"c1".into(), &assignment(&["c1", "c2"]), config(), start).unwrap();
        session.tear_down("operator request");
        session.tear_down("twice");

        assert!(session.tick(start).unwrap().is_empty());
        assert!(session.status().torn_down);
        assert_eq!(
            session.handle_heartbeat(1, 3, &"c2".into(), start),
            HeartbeatVerdict::Ignored(IgnoreReason::TornDown)
        );
        let events = session.drain_events();
        let torn: Vec<_> = events.iter().filter(|e| matches!(e, SessionEvent::TornDown { .. })).collect();
        assert_eq!(torn.len(), 1);
    }
}
