//! HTTP API Module
//!
//! Read-only REST API for monitoring clients and the matchmaker.

mod http;

pub use http::{HistoryResponse, HttpServer, PeerHealthResponse, PendingResponse, RegistryHealthResponse};
