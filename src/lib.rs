//! # KCP Conversation
//!
//! A reliable, ordered conversation over an unreliable datagram transport,
//! speaking the KCP wire protocol (ARQ with selective and fast retransmit,
//! sliding windows and optional congestion control).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kcp_conversation::{KcpConfig, KcpConversation, UdpTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await?);
//!     let remote = "127.0.0.1:9000".parse()?;
//!     let config = KcpConfig::new().fast_mode().conversation_id(42);
//!     let conversation = Arc::new(KcpConversation::new(transport, remote, config)?);
//!
//!     let pump = conversation.clone();
//!     tokio::spawn(async move { pump.receive_from_transport().await });
//!
//!     conversation.send_async(b"Hello, KCP!", None).await?;
//!
//!     let mut buffer = [0u8; 1024];
//!     let result = conversation.receive_async(&mut buffer, None).await?;
//!     if !result.transport_closed {
//!         println!("Received: {:?}", &buffer[..result.bytes_received]);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   KcpConversation   │  send/receive queues, pending-operation slots
//! ├─────────────────────┤
//! │   Control Loop      │  UpdateActivation: timer ticks + inbound packets
//! ├─────────────────────┤
//! │   KcpEngine         │  ARQ state machine, windows, RTO, congestion
//! ├─────────────────────┤
//! │   Transport         │  UDP socket or any datagram sink
//! └─────────────────────┘
//! ```

pub mod ack_list;
pub mod activation;
pub mod buffer_pool;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod metrics;
mod pending;
pub mod protocol;
pub mod receive_queue;
pub mod send_queue;
pub mod transport;

// Re-exports
pub use buffer_pool::{BufferPool, DefaultBufferPool, PooledBuffer};
pub use config::{KcpConfig, KeepAliveConfig, NodeDelayConfig, ReceiveWindowNotificationConfig};
pub use conversation::{ExceptionHandler, KcpConversation};
pub use error::{CancelCause, ConnectionError, KcpError, Result};
pub use protocol::{Command, ConvId, KcpStats, PacketHeader};
pub use receive_queue::ReceiveResult;
pub use transport::{Transport, UdpTransport};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
