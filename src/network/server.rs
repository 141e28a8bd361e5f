//! Network Server
//!
//! TCP listener for registrations, assignments, heartbeats and status
//! queries.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{read_message, write_message, MessageHandler};
use crate::protocol::Message;
use crate::error::{Error, Result};

/// Network server
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: Option<MessageHandler>,
    /// Channel for incoming messages
    incoming_tx: mpsc::Sender<(String, Message)>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(
        bind_address: String,
        incoming_tx: mpsc::Sender<(String, Message)>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            handler: None,
            incoming_tx,
            shutdown: shutdown_tx,
        }
    }

    /// Set the message handler
    pub fn set_handler(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Bind the listener. Fails if the address is taken.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| Error::Network(format!("failed to bind {}: {}", self.bind_address, e)))
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", self.bind_address);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), incoming_tx, handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    incoming_tx: mpsc::Sender<(String, Message)>,
    handler: Option<MessageHandler>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                // Answered in place, nothing to forward
                if let Some(ref handler) = handler {
                    if let Some(response) = handler(peer_addr.clone(), message.clone()) {
                        write_message(&mut writer, &response).await?;
                        continue;
                    }
                }

                if incoming_tx.send((peer_addr.clone(), message)).await.is_err() {
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e @ Error::MalformedMessage(_)) => {
                // The frame was read in full, so the stream is still aligned
                tracing::warn!("Dropping message from {}: {}", peer_addr, e);
                continue;
            }
            Err(e @ Error::FrameTooLarge { .. }) => {
                tracing::warn!("Dropping connection from {}: {}", peer_addr, e);
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}
