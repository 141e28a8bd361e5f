//! HTTP API Server
//!
//! Read-only status endpoints. A client serves its role, status and role
//! history; the matchmaker serves its pending pool and formed sessions.

use std::sync::Arc;
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::peer::{PeerNode, PeerStatus};
use crate::protocol::{ClientId, Role};
use crate::registry::{FormedSession, PendingClient, SessionRegistry};
use crate::state::{history, RoleTransition};
use crate::error::{Error, Result};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    router: Router,
}

impl HttpServer {
    /// API for a session client
    pub fn for_peer(config: ApiConfig, node: Arc<PeerNode>) -> Self {
        let router = Router::new()
            .route("/health", get(handle_peer_health))
            .route("/status", get(handle_peer_status))
            .route("/history", get(handle_peer_history))
            .with_state(node);

        Self { config, router }
    }

    /// API for the matchmaker
    pub fn for_registry(config: ApiConfig, registry: Arc<SessionRegistry>) -> Self {
        let router = Router::new()
            .route("/health", get(handle_registry_health))
            .route("/pending", get(handle_pending))
            .route("/sessions", get(handle_sessions))
            .with_state(registry);

        Self { config, router }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self
            .router
            .clone()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Client health response
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerHealthResponse {
    pub healthy: bool,
    pub client_id: ClientId,
    pub role: Option<Role>,
}

/// Role history response
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub client_id: ClientId,
    /// Transitions, oldest first
    pub entries: Vec<RoleTransition>,
    /// First transition into leader
    pub became_leader: Option<RoleTransition>,
    /// Whether a node entry follows a leader entry
    pub reverted: bool,
}

/// Matchmaker health response
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryHealthResponse {
    pub healthy: bool,
    pub pending: usize,
    pub sessions: usize,
    pub closed: bool,
}

/// Pending pool response
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub count: usize,
    pub closed: bool,
    pub clients: Vec<PendingClient>,
}

// ============ Handlers ============

async fn handle_peer_health(State(node): State<Arc<PeerNode>>) -> Json<PeerHealthResponse> {
    let status = node.status();
    Json(PeerHealthResponse {
        healthy: !status.torn_down,
        client_id: status.client_id,
        role: status.role,
    })
}

async fn handle_peer_status(State(node): State<Arc<PeerNode>>) -> Json<PeerStatus> {
    Json(node.status())
}

async fn handle_peer_history(State(node): State<Arc<PeerNode>>) -> Json<HistoryResponse> {
    let status = node.status();
    let became_leader = status.history.iter().find(|t| t.role == Role::Leader).cloned();
    let reverted = history::has_reverted(&status.history);

    Json(HistoryResponse {
        client_id: status.client_id,
        entries: status.history,
        became_leader,
        reverted,
    })
}

async fn handle_registry_health(State(registry): State<Arc<SessionRegistry>>) -> Json<RegistryHealthResponse> {
    Json(RegistryHealthResponse {
        healthy: true,
        pending: registry.pending_count(),
        sessions: registry.sessions().len(),
        closed: registry.is_closed(),
    })
}

async fn handle_pending(State(registry): State<Arc<SessionRegistry>>) -> Json<PendingResponse> {
    let clients = registry.pending_clients();
    Json(PendingResponse {
        count: clients.len(),
        closed: registry.is_closed(),
        clients,
    })
}

async fn handle_sessions(State(registry): State<Arc<SessionRegistry>>) -> Json<Vec<FormedSession>> {
    Json(registry.sessions())
}
