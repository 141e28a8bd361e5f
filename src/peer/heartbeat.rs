//! Heartbeat Subsystem
//!
//! The leader emits a heartbeat to every live peer each interval. Every
//! other member records heartbeat arrivals and presumes the leader dead
//! once it has been silent for `k × interval`.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::protocol::{ClientId, Epoch, Message};
use crate::state::{LivenessRecord, MembershipView};

/// Heartbeat timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Emission interval (I)
    pub interval: Duration,
    /// Leader timeout multiplier (k)
    pub timeout_multiplier: u32,
    /// Wait for a presumptive successor's first heartbeat
    pub grace: Duration,
}

impl HeartbeatConfig {
    /// Leader timeout (k × I)
    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_multiplier
    }

    /// Upper bound on one succession step: detection plus grace
    pub fn convergence_bound(&self) -> Duration {
        self.timeout() + self.grace
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for HeartbeatConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            timeout_multiplier: config.timeout_multiplier,
            grace: config.grace(),
        }
    }
}

/// Emission schedule and failure detector for one client
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    /// Next emission time while leading
    next_emit: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config, next_emit: None }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start emitting; the first heartbeat is due immediately
    pub fn start_emitting(&mut self, now: Instant) {
        self.next_emit = Some(now);
    }

    pub fn is_emitting(&self) -> bool {
        self.next_emit.is_some()
    }

    /// Whether a heartbeat is due, advancing the schedule if so.
    /// A schedule that fell behind restarts from `now` rather than bursting.
    pub fn emit_due(&mut self, now: Instant) -> bool {
        match self.next_emit {
            Some(next) if now >= next => {
                let following = next + self.config.interval;
                self.next_emit = Some(if following > now { following } else { now + self.config.interval });
                true
            }
            _ => false,
        }
    }

    /// One heartbeat per live peer, addressed by peer address
    pub fn heartbeats(&self, view: &MembershipView, epoch: Epoch) -> Vec<(String, Message)> {
        view.alive_peers()
            .map(|peer| {
                (
                    peer.address.clone(),
                    Message::Heartbeat {
                        session_id: view.session_id(),
                        epoch,
                        leader_id: view.local_id().clone(),
                    },
                )
            })
            .collect()
    }

    /// Record a valid heartbeat from the leader
    pub fn record(&self, liveness: &mut LivenessRecord, leader: &ClientId, now: Instant) {
        liveness.record(leader, now);
    }

    /// Whether the leader has been silent past the timeout
    pub fn leader_overdue(&self, liveness: &LivenessRecord, leader: &ClientId, now: Instant) -> bool {
        liveness.is_overdue(leader, now, self.config.timeout())
    }
}
