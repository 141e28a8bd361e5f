//! Registry Service
//!
//! Accepts registrations, closes formation windows on schedule and
//! dispatches each roster. After dispatch the registry keeps only a
//! read-only record of the session; it never takes part in elections.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::pool::{FormationPolicy, FormationReport, PendingClient, PendingPool, RegistrationOutcome};
use crate::error::{Error, Result};
use crate::network::{MessageHandler, Transport};
use crate::protocol::{ClientId, ErrorCode, Member, Message, SessionId};

/// A dispatched session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormedSession {
    pub session_id: SessionId,
    /// Members in rank order
    pub members: Vec<Member>,
    pub leader_id: ClientId,
    pub formed_at: DateTime<Utc>,
    /// Members the assignment could not be delivered to
    pub unreachable: Vec<ClientId>,
}

/// Matchmaking session registry
pub struct SessionRegistry {
    /// Pending pool (single writer)
    pool: Mutex<PendingPool>,
    /// Formed sessions
    sessions: RwLock<Vec<FormedSession>>,
    /// Outbound delivery
    transport: Arc<dyn Transport>,
    /// Wakes the formation loop on registration
    wake: Notify,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl SessionRegistry {
    /// Create a registry; a startup-anchored window opens now
    pub fn new(policy: FormationPolicy, transport: Arc<dyn Transport>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pool: Mutex::new(PendingPool::new(policy, Instant::now())),
            sessions: RwLock::new(Vec::new()),
            transport,
            wake: Notify::new(),
            shutdown,
        }
    }

    fn pool(&self) -> Result<MutexGuard<'_, PendingPool>> {
        self.pool
            .lock()
            .map_err(|_| Error::Internal("pending pool lock poisoned".into()))
    }

    /// Register a client for the next formation
    pub fn register(&self, client_id: ClientId, address: String) -> Result<RegistrationOutcome> {
        if *self.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }

        let outcome = {
            let mut pool = self.pool()?;
            pool.register(client_id.clone(), address.clone(), Instant::now())?
        };

        match outcome {
            RegistrationOutcome::Queued { pending } => {
                tracing::info!("Registered {} at {} ({} pending)", client_id, address, pending);
                self.wake.notify_one();
            }
            RegistrationOutcome::AlreadyPending { pending } => {
                tracing::debug!("{} re-registered ({} pending)", client_id, pending);
            }
            RegistrationOutcome::AlreadySeated { session_id, .. } => {
                tracing::info!("{} re-registered but is already in session {}", client_id, session_id);
            }
        }
        Ok(outcome)
    }

    /// Answer a registry message in place
    pub fn handle_message(&self, from: &str, message: Message) -> Message {
        match message {
            Message::Register { client_id, address } => match self.register(client_id.clone(), address) {
                Ok(outcome) => Message::RegisterResponse {
                    accepted: true,
                    reason: match outcome {
                        RegistrationOutcome::AlreadySeated { session_id, .. } => {
                            Some(format!("already assigned to session {}", session_id))
                        }
                        _ => None,
                    },
                    pending: outcome.pending(),
                },
                Err(e) => {
                    tracing::warn!("Rejected registration from {}: {}", client_id, e);
                    Message::RegisterResponse {
                        accepted: false,
                        reason: Some(e.to_string()),
                        pending: self.pending_count(),
                    }
                }
            },
            other => {
                tracing::debug!("Unexpected {} from {}", other.type_name(), from);
                Message::Error {
                    code: ErrorCode::UnexpectedMessage,
                    message: format!("matchmaker does not handle {}", other.type_name()),
                }
            }
        }
    }

    /// Handler for the network server; every message is answered in place
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let registry = self.clone();
        Arc::new(move |from, message| Some(registry.handle_message(&from, message)))
    }

    /// Run the formation loop until stopped
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let (deadline, full) = {
                let pool = self.pool()?;
                (pool.window_deadline(), pool.is_full())
            };

            if full {
                self.close_window(Instant::now()).await?;
                continue;
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = sleep_until(deadline) => {
                    self.close_window(Instant::now()).await?;
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Session registry stopped");
        Ok(())
    }

    /// Close the current window and dispatch whatever formed
    pub async fn close_window(&self, now: Instant) -> Result<FormationReport> {
        let report = self.pool()?.form_sessions(now);

        for plan in &report.sessions {
            let assignment = plan.to_assignment();

            let deliveries = assignment.members.iter().map(|member| {
                self.transport
                    .send(&member.address, Message::SessionAssignment(assignment.clone()))
            });
            let results = futures::future::join_all(deliveries).await;

            let mut unreachable = Vec::new();
            for (member, result) in assignment.members.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!("Could not deliver session {} to {}: {}", assignment.session_id, member.id, e);
                    unreachable.push(member.id.clone());
                }
            }

            let roster: Vec<&str> = assignment.members.iter().map(|m| m.id.as_str()).collect();
            tracing::info!(
                "Session {} formed: [{}], leader {}",
                assignment.session_id,
                roster.join(", "),
                assignment.leader_id
            );

            self.sessions
                .write()
                .map_err(|_| Error::Internal("session table lock poisoned".into()))?
                .push(FormedSession {
                    session_id: assignment.session_id,
                    members: assignment.members,
                    leader_id: assignment.leader_id,
                    formed_at: Utc::now(),
                    unreachable,
                });
        }

        if !report.deferred.is_empty() {
            tracing::info!("{} client(s) deferred to the next window", report.deferred.len());
        }

        for client in &report.stranded {
            tracing::warn!("Registry closed; {} will not be placed in a session", client.id);
            let rejection = Message::RegisterResponse {
                accepted: false,
                reason: Some(
                    Error::RegistrationAfterClose {
                        reason: "registry closed before a session could be formed".into(),
                    }
                    .to_string(),
                ),
                pending: 0,
            };
            if let Err(e) = self.transport.send(&client.address, rejection).await {
                tracing::debug!("Could not notify {}: {}", client.id, e);
            }
        }

        Ok(report)
    }

    /// Clients waiting for a session
    pub fn pending_clients(&self) -> Vec<PendingClient> {
        self.pool().map(|pool| pool.pending().to_vec()).unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pool().map(|pool| pool.pending().len()).unwrap_or_default()
    }

    /// Whether late registrations are now rejected
    pub fn is_closed(&self) -> bool {
        self.pool().map(|pool| pool.is_closed()).unwrap_or(true)
    }

    /// Formed sessions, oldest first
    pub fn sessions(&self) -> Vec<FormedSession> {
        self.sessions.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Stop the formation loop
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use crate::config::{LateRegistration, MatchmakerConfig, PartitionPolicy};
    use crate::network::MemoryTransport;
    use crate::protocol::SessionAssignment;

    const WINDOW: Duration = Duration::from_secs(10);

    fn policy() -> FormationPolicy {
        FormationPolicy::from(&MatchmakerConfig::default())
    }

    fn client(transport: &MemoryTransport, id: &str) -> mpsc::Receiver<(String, Message)> {
        let (tx, rx) = mpsc::channel(8);
        transport.bind(id, tx, None);
        rx
    }

    fn assignment(rx: &mut mpsc::Receiver<(String, Message)>) -> SessionAssignment {
        match rx.try_recv() {
            Ok((_, Message::SessionAssignment(a))) => a,
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_forms_single_session() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(SessionRegistry::new(policy(), transport.clone()));
        let mut rx: Vec<_> = ["c1", "c2", "c3"].iter().map(|id| client(&transport, id)).collect();

        let runner = registry.clone();
        tokio::spawn(async move { runner.run().await });

        for id in ["c1", "c2", "c3"] {
            registry.register(id.into(), id.to_string()).unwrap();
        }
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;

        for rx in rx.iter_mut() {
            let a = assignment(rx);
            assert_eq!(a.session_id, 1);
            assert_eq!(a.leader_id.as_str(), "c1");
            let ids: Vec<_> = a.members.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["c1", "c2", "c3"]);
        }

        let sessions = registry.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].unreachable.is_empty());
        assert_eq!(registry.pending_count(), 0);
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pool_forms_immediately() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(SessionRegistry::new(
            FormationPolicy { max_size: Some(2), ..policy() },
            transport.clone(),
        ));
        let mut rx1 = client(&transport, "c1");
        let _rx2 = client(&transport, "c2");

        let runner = registry.clone();
        tokio::spawn(async move { runner.run().await });

        registry.register("c1".into(), "c1".into()).unwrap();
        registry.register("c2".into(), "c2".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(assignment(&mut rx1).members.len(), 2);
        assert_eq!(registry.sessions().len(), 1);
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_member_is_recorded() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = SessionRegistry::new(policy(), transport.clone());
        let _rx = client(&transport, "c1");

        registry.register("c1".into(), "c1".into()).unwrap();
        registry.register("c2".into(), "gone".into()).unwrap();
        let report = registry.close_window(Instant::now()).await.unwrap();

        assert_eq!(report.sessions.len(), 1);
        assert_eq!(registry.sessions()[0].unreachable, vec![ClientId::from("c2")]);
    }

    #[tokio::test]
    async fn test_register_message_and_late_rejection() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = SessionRegistry::new(
            FormationPolicy {
                late_registration: LateRegistration::Reject,
                partition: PartitionPolicy::AllPending,
                ..policy()
            },
            transport.clone(),
        );
        let _rx1 = client(&transport, "c1");
        let _rx2 = client(&transport, "c2");

        let reply = registry.handle_message("x", Message::Register { client_id: "c1".into(), address: "c1".into() });
        assert!(matches!(reply, Message::RegisterResponse { accepted: true, pending: 1, .. }));
        registry.handle_message("x", Message::Register { client_id: "c2".into(), address: "c2".into() });

        registry.close_window(Instant::now()).await.unwrap();
        assert!(registry.is_closed());

        match registry.handle_message("x", Message::Register { client_id: "c3".into(), address: "c3".into() }) {
            Message::RegisterResponse { accepted, reason, .. } => {
                assert!(!accepted);
                assert!(reason.unwrap().contains("after close"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stranded_client_is_told() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = SessionRegistry::new(
            FormationPolicy {
                max_size: Some(2),
                partition: PartitionPolicy::FixedSize,
                late_registration: LateRegistration::Reject,
                ..policy()
            },
            transport.clone(),
        );
        let _rx1 = client(&transport, "c1");
        let _rx2 = client(&transport, "c2");
        let mut rx3 = client(&transport, "c3");
        for id in ["c1", "c2", "c3"] {
            registry.register(id.into(), id.to_string()).unwrap();
        }

        registry.close_window(Instant::now()).await.unwrap();
        match rx3.try_recv() {
            Ok((_, Message::RegisterResponse { accepted: false, reason: Some(reason), .. })) => {
                assert!(reason.contains("closed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_seated_client_gets_no_second_session() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = SessionRegistry::new(policy(), transport.clone());
        let mut rx1 = client(&transport, "c1");
        let _rx2 = client(&transport, "c2");
        let _rx9 = client(&transport, "c9");

        registry.register("c1".into(), "c1".into()).unwrap();
        registry.register("c2".into(), "c2".into()).unwrap();
        registry.close_window(Instant::now()).await.unwrap();
        assert_eq!(assignment(&mut rx1).session_id, 1);

        match registry.handle_message("x", Message::Register { client_id: "c1".into(), address: "c1".into() }) {
            Message::RegisterResponse { accepted, reason, pending } => {
                assert!(accepted);
                assert_eq!(pending, 0);
                assert!(reason.unwrap().contains("session 1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        registry.register("c9".into(), "c9".into()).unwrap();
        let report = registry.close_window(Instant::now()).await.unwrap();
        assert!(report.sessions.is_empty());
        assert_eq!(report.deferred, vec![ClientId::from("c9")]);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_after_stop_is_rejected() {
        let registry = SessionRegistry::new(policy(), Arc::new(MemoryTransport::new()));
        registry.stop();

        assert!(matches!(registry.register("c1".into(), "c1".into()), Err(Error::ShuttingDown)));
        match registry.handle_message("x", Message::Register { client_id: "c1".into(), address: "c1".into() }) {
            Message::RegisterResponse { accepted, reason, .. } => {
                assert!(!accepted);
                assert!(reason.unwrap().contains("Shutdown"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_message_is_answered_with_error() {
        let registry = SessionRegistry::new(policy(), Arc::new(MemoryTransport::new()));
        let reply = registry.handle_message("x", Message::StatusRequest);
        assert!(matches!(reply, Message::Error { code: ErrorCode::UnexpectedMessage, .. }));
    }
}
