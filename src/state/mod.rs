//! State Management Module
//!
//! Per-client session state: the frozen membership view, the liveness
//! record, the election state machine and the role history.

mod membership;
mod liveness;
pub mod election;
pub mod history;

pub use membership::MembershipView;
pub use liveness::LivenessRecord;
pub use election::{ElectionEngine, ElectionOutcome, ElectionState, HeartbeatVerdict, IgnoreReason, PendingSuccessor};
pub use history::{RoleHistory, RoleTransition, TransitionReason};
