//! Network Module
//!
//! Framed TCP between clients and the matchmaker, and an in-process
//! transport with the same delivery semantics for tests and simulations.

mod server;
mod client;
mod memory;

pub use server::NetworkServer;
pub use client::NetworkClient;
pub use memory::MemoryTransport;

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{FrameHeader, Message};
use crate::error::{Error, Result};

/// Synchronous hook answering a message in place.
///
/// Called with the sender's address and the message. Returning `Some`
/// writes the reply back on the same connection; returning `None` passes
/// the message on to the incoming channel.
pub type MessageHandler = Arc<dyn Fn(String, Message) -> Option<Message> + Send + Sync>;

/// Point-to-point message delivery.
///
/// Delivery is best-effort: a send to an unreachable peer fails or is
/// silently lost, and nothing is retried at this layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message without waiting for a reply
    async fn send(&self, address: &str, message: Message) -> Result<()>;

    /// Deliver a message and wait for the receiver's direct reply
    async fn request(&self, address: &str, message: Message) -> Result<Message>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::FrameTooLarge {
            length: header.length,
            limit: FrameHeader::MAX_LENGTH,
        });
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if !header.verify(&body) {
        return Err(Error::MalformedMessage("message checksum mismatch".into()));
    }

    Message::deserialize(&body).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientId;

    #[tokio::test]
    async fn test_frame_roundtrip_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let message = Message::Register {
            client_id: ClientId::new("c1"),
            address: "127.0.0.1:7001".into(),
        };

        write_message(&mut a, &message).await.unwrap();
        match read_message(&mut b).await.unwrap() {
            Message::Register { client_id, address } => {
                assert_eq!(client_id.as_str(), "c1");
                assert_eq!(address, "127.0.0.1:7001");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_malformed() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::StatusRequest.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let header = FrameHeader {
            length: FrameHeader::MAX_LENGTH + 1,
            checksum: 0,
        };
        a.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::FrameTooLarge { .. })));
    }
}
