//! # Transport Abstraction
//!
//! The byte pipe underneath a connection.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: a transport knows nothing about frames, services or
//!   schemas. It moves opaque, already-encoded buffers.
//! - **One-Way**: `send` pushes bytes to the peer and returns. Whatever the peer
//!   sends back arrives through the owner's `on_receive`, so the same trait
//!   serves both long-lived duplex links and one-shot request links.

use std::fmt;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A mechanism to push a byte buffer to the peer.
///
/// This trait is object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one encoded frame.
    ///
    /// # Invariants
    /// - Must return `Err` if the bytes could not be handed to the peer.
    /// - Must not interpret the payload.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Tears the link down. Later sends should fail with `ConnectionLost`.
    async fn close(&self, _reason: Option<&str>) {}
}
