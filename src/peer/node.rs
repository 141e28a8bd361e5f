//! Peer Node Runtime
//!
//! Drives a [`Session`] from the network and the clock. Three loops run
//! concurrently inside [`PeerNode::run`]: inbound messages, the timer and
//! outbound delivery. The first two share the session behind one mutex so
//! role and epoch changes are serialized. Delivery fans out to one lane
//! per peer, so a peer that stalls only delays its own heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::heartbeat::HeartbeatConfig;
use super::session::{PeerStatus, Session, SessionEvent};
use crate::error::{Error, Result};
use crate::network::{MessageHandler, Transport};
use crate::protocol::{ClientId, Message, Role};

/// Capacity of the outbound queue
const OUTGOING_CAPACITY: usize = 1024;

/// Heartbeats buffered per peer before new ones are dropped
const LANE_CAPACITY: usize = 4;

/// Capacity of the event broadcast
const EVENT_CAPACITY: usize = 256;

/// A session client
pub struct PeerNode {
    /// This client's ID
    client_id: ClientId,
    /// Address peers and the matchmaker reach us on
    address: String,
    /// Heartbeat timing
    heartbeat: HeartbeatConfig,
    /// Timer loop resolution
    tick: Duration,
    /// Session, once assigned
    session: Mutex<Option<Session>>,
    /// Outbound delivery
    transport: Arc<dyn Transport>,
    /// Latest status snapshot
    status: watch::Sender<PeerStatus>,
    /// Session events
    events: broadcast::Sender<SessionEvent>,
    /// Outbound queue
    outgoing_tx: mpsc::Sender<(String, Message)>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<(String, Message)>>>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl PeerNode {
    /// Create a new peer node
    pub fn new(
        client_id: ClientId,
        address: String,
        heartbeat: HeartbeatConfig,
        tick: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (status, _) = watch::channel(PeerStatus::unassigned(client_id.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            client_id,
            address,
            heartbeat,
            tick,
            session: Mutex::new(None),
            transport,
            status,
            events,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            shutdown,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current status snapshot
    pub fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn watch_status(&self) -> watch::Receiver<PeerStatus> {
        self.status.subscribe()
    }

    /// Current role, once assigned
    pub fn role(&self) -> Option<Role> {
        self.status.borrow().role
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register with the matchmaker, retrying while it is unreachable.
    /// Returns the number of clients pending after registration.
    pub async fn register(&self, matchmaker: &str, attempts: u32, retry: Duration) -> Result<usize> {
        let attempts = attempts.max(1);
        let mut attempt = 0;

        loop {
            if *self.shutdown.borrow() {
                return Err(Error::ShuttingDown);
            }
            attempt += 1;
            let request = Message::Register {
                client_id: self.client_id.clone(),
                address: self.address.clone(),
            };

            match self.transport.request(matchmaker, request).await {
                Ok(Message::RegisterResponse { accepted: true, pending, .. }) => {
                    tracing::info!("{} registered with {} ({} pending)", self.client_id, matchmaker, pending);
                    return Ok(pending);
                }
                Ok(Message::RegisterResponse { accepted: false, reason, .. }) => {
                    return Err(Error::RegistrationRejected(
                        reason.unwrap_or_else(|| "no reason given".into()),
                    ));
                }
                Ok(other) => {
                    return Err(Error::MalformedMessage(format!(
                        "unexpected {} in reply to Register",
                        other.type_name()
                    )));
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        "Matchmaker {} unreachable (attempt {}/{}): {}",
                        matchmaker,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handler answering status queries in place
    pub fn handler(&self) -> MessageHandler {
        let status = self.status.subscribe();
        Arc::new(move |_, message| match message {
            Message::StatusRequest => Some(Message::StatusResponse(status.borrow().clone())),
            _ => None,
        })
    }

    /// Run until stopped
    pub async fn run(&self, mut incoming_rx: mpsc::Receiver<(String, Message)>) -> Result<()> {
        let mut outgoing_rx = self
            .outgoing_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("peer node is already running".into()))?;
        let mut shutdown_rx = self.shutdown.subscribe();

        let inbound = async {
            while let Some((from, message)) = incoming_rx.recv().await {
                self.handle_message(&from, message).await;
            }
        };

        let timer = async {
            let mut ticker = interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.on_tick(Instant::now()).await;
            }
        };

        let delivery = async {
            let mut lanes: HashMap<String, mpsc::Sender<Message>> = HashMap::new();
            while let Some((address, message)) = outgoing_rx.recv().await {
                let lane = lanes
                    .entry(address.clone())
                    .or_insert_with(|| self.open_lane(address.clone()));
                match lane.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(message)) => {
                        tracing::debug!("Lane to {} is backed up; dropping {}", address, message.type_name());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        lanes.remove(&address);
                    }
                }
            }
        };

        tokio::select! {
            _ = inbound => tracing::info!("Inbound channel closed"),
            _ = timer => {}
            _ = delivery => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => {}
        }

        tracing::info!("{} stopped", self.client_id);
        Ok(())
    }

    /// Spawn the delivery task for one peer. Each send is bounded by the
    /// heartbeat interval. The task ends once its sender is dropped.
    fn open_lane(&self, address: String) -> mpsc::Sender<Message> {
        let (tx, mut rx) = mpsc::channel::<Message>(LANE_CAPACITY);
        let transport = Arc::clone(&self.transport);
        let send_timeout = self.heartbeat.interval;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                tracing::trace!("Sending {} to {}", message.type_name(), address);
                let result = match tokio::time::timeout(send_timeout, transport.send(&address, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ConnectionTimeout(address.clone())),
                };
                // Unreachable peers surface through heartbeat timeouts
                if let Err(e) = result {
                    if e.is_ignorable() || e.is_retryable() {
                        tracing::debug!("Failed to deliver to {}: {}", address, e);
                    } else {
                        tracing::warn!("Failed to deliver to {}: {}", address, e);
                    }
                }
            }
        });
        tx
    }

    /// Stop the node
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Handle one inbound message
    pub async fn handle_message(&self, from: &str, message: Message) {
        let mut guard = self.session.lock().await;

        match message {
            Message::SessionAssignment(assignment) => {
                if let Some(current) = guard.as_ref() {
                    tracing::warn!(
                        "Ignoring assignment to session {}; already in session {}",
                        assignment.session_id,
                        current.view().session_id()
                    );
                    return;
                }
                match Session::from_assignment(&self.client_id, &assignment, self.heartbeat, Instant::now()) {
                    Ok(session) => *guard = Some(session),
                    Err(e) => {
                        tracing::warn!("Dropping assignment from {}: {}", from, e);
                        return;
                    }
                }
            }
            Message::Heartbeat { session_id, epoch, leader_id } => match guard.as_mut() {
                Some(session) => {
                    session.handle_heartbeat(session_id, epoch, &leader_id, Instant::now());
                }
                None => {
                    tracing::debug!("Heartbeat from {} before assignment", leader_id);
                    return;
                }
            },
            Message::RegisterResponse { accepted: false, reason, .. } => {
                tracing::error!(
                    "Matchmaker withdrew registration: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                return;
            }
            other => {
                tracing::debug!("Unexpected {} from {}", other.type_name(), from);
                return;
            }
        }

        if let Some(session) = guard.as_mut() {
            self.publish(session);
        }
    }

    /// Advance the session's timers and queue its heartbeats
    async fn on_tick(&self, now: Instant) {
        let outbound = {
            let mut guard = self.session.lock().await;
            let Some(session) = guard.as_mut() else {
                return;
            };

            let outbound = match session.tick(now) {
                Ok(outbound) => outbound,
                Err(e) => {
                    tracing::error!("Election failed: {}", e);
                    Vec::new()
                }
            };
            self.publish(session);
            outbound
        };

        for item in outbound {
            if self.outgoing_tx.send(item).await.is_err() {
                break;
            }
        }
    }

    /// Broadcast queued events and refresh the status snapshot
    fn publish(&self, session: &mut Session) {
        let events = session.drain_events();
        if events.is_empty() {
            return;
        }
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        self.status.send_replace(session.status());
    }
}
