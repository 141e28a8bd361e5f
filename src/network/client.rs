//! Network Client
//!
//! TCP client for reaching the matchmaker and session peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;

use super::{read_message, write_message, Transport};
use crate::protocol::Message;
use crate::error::{Error, Result};

/// Network client with a per-peer pool of one-way connections
pub struct NetworkClient {
    /// Idle connections: address -> write half
    pool: Arc<RwLock<HashMap<String, OwnedWriteHalf>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
    /// Bound on one `send` attempt, connect included
    send_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            request_timeout,
            send_timeout: request_timeout,
        }
    }

    /// Bound each `send` attempt separately from requests
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(
            self.connect_timeout,
            TcpStream::connect(address),
        ).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Write one frame. The connection is checked out of the pool while
    /// in use and only returned after a complete write, so a cancelled or
    /// failed send never leaves a partial frame on a pooled connection.
    async fn send_inner(&self, address: &str, message: &Message) -> Result<()> {
        let pooled = self.pool.write().await.remove(address);
        let mut writer = match pooled {
            Some(writer) => writer,
            None => {
                // Replies are never expected on this connection
                let (_, writer) = self.connect(address).await?.into_split();
                writer
            }
        };

        write_message(&mut writer, message).await?;
        self.pool.write().await.insert(address.to_string(), writer);
        Ok(())
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

#[async_trait]
impl Transport for NetworkClient {
    async fn send(&self, address: &str, message: Message) -> Result<()> {
        let first = timeout(self.send_timeout, self.send_inner(address, &message)).await;
        match first {
            Ok(Ok(())) => return Ok(()),
            // Nothing answered in time; a second attempt would only double the stall
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
            // Stale pooled connection: reconnect once
            Ok(Err(e)) => tracing::debug!("Send to {} failed, reconnecting: {}", address, e),
        }

        match timeout(self.send_timeout, self.send_inner(address, &message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, async {
            let mut stream = self.connect(address).await?;
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            read_message(&mut reader).await
        }).await;

        match result {
            Ok(Err(Error::Io(e))) => Err(Error::ConnectionLost(format!("{}: {}", address, e))),
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}
