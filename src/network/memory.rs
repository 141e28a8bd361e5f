//! In-Process Transport
//!
//! Routes messages between endpoints living in the same process, keyed by
//! address. Endpoints answer through the same [`MessageHandler`] hook the
//! TCP server uses, so registry and peer code run unchanged on top of it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{MessageHandler, Transport};
use crate::protocol::Message;
use crate::error::{Error, Result};

/// Sender address reported for in-process deliveries
const MEMORY_PEER: &str = "memory";

#[derive(Clone)]
struct Endpoint {
    incoming: mpsc::Sender<(String, Message)>,
    handler: Option<MessageHandler>,
}

/// In-process transport
#[derive(Default)]
pub struct MemoryTransport {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `address`, replacing any previous one
    pub fn bind(
        &self,
        address: impl Into<String>,
        incoming: mpsc::Sender<(String, Message)>,
        handler: Option<MessageHandler>,
    ) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(address.into(), Endpoint { incoming, handler });
        }
    }

    /// Detach an endpoint. Later deliveries to it fail, like a crashed process.
    pub fn disconnect(&self, address: &str) -> bool {
        self.endpoints
            .lock()
            .map(|mut endpoints| endpoints.remove(address).is_some())
            .unwrap_or(false)
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.endpoint(address).is_some()
    }

    fn endpoint(&self, address: &str) -> Option<Endpoint> {
        self.endpoints.lock().ok()?.get(address).cloned()
    }

    /// Offer the message to the endpoint's handler, then its channel
    async fn deliver(&self, address: &str, message: Message) -> Result<Option<Message>> {
        let endpoint = self
            .endpoint(address)
            .ok_or_else(|| Error::ConnectionLost(address.to_string()))?;

        if let Some(handler) = &endpoint.handler {
            if let Some(reply) = handler(MEMORY_PEER.to_string(), message.clone()) {
                return Ok(Some(reply));
            }
        }

        endpoint
            .incoming
            .send((MEMORY_PEER.to_string(), message))
            .await
            .map_err(|_| Error::ConnectionLost(address.to_string()))?;
        Ok(None)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, address: &str, message: Message) -> Result<()> {
        self.deliver(address, message).await.map(|_| ())
    }

    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.deliver(address, message)
            .await?
            .ok_or_else(|| Error::Network(format!("{} sent no reply", address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::protocol::{ClientId, ErrorCode};

    #[tokio::test]
    async fn test_send_reaches_channel() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        transport.bind("c1", tx, None);

        let heartbeat = Message::Heartbeat { session_id: 1, epoch: 0, leader_id: ClientId::new("c0") };
        transport.send("c1", heartbeat).await.unwrap();

        let (from, message) = rx.recv().await.unwrap();
        assert_eq!(from, MEMORY_PEER);
        assert_eq!(message.type_name(), "Heartbeat");
    }

    #[tokio::test]
    async fn test_request_uses_handler() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handler: MessageHandler = Arc::new(|_, _| {
            Some(Message::Error { code: ErrorCode::UnexpectedMessage, message: "bye".into() })
        });
        transport.bind("m", tx, Some(handler));

        let reply = transport.request("m", Message::StatusRequest).await.unwrap();
        assert!(matches!(reply, Message::Error { code: ErrorCode::UnexpectedMessage, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_endpoint_fails() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::channel(4);
        transport.bind("c1", tx, None);

        assert!(transport.disconnect("c1"));
        assert!(!transport.is_bound("c1"));
        let err = transport.send("c1", Message::StatusRequest).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert!(!transport.disconnect("c1"));
    }
}
