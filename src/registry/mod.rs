//! Session Registry
//!
//! The matchmaking side of the system. Clients register, wait out a
//! formation window, and are handed a ranked roster; rank 0 starts as
//! leader at epoch 0.

mod pool;
mod service;

pub use pool::{FormationPolicy, FormationReport, PendingClient, PendingPool, RegistrationOutcome, SessionPlan};
pub use service::{FormedSession, SessionRegistry};
