//! Transport capability
//!
//! The bus core never talks to a physical link directly. Each attached
//! interface registers an adapter implementing [`Transport`], which only
//! has to accept an enveloped message and hand back a cancelable handle.
//! Fragmentation, checksums and link handshakes stay inside the adapter.
//!
//! Provided adapters:
//! - [`ChannelTransport`] pushes frames into a tokio channel (simulated modules, tests)

mod loopback;

pub use loopback::{ChannelTransport, FrameReceiver};

use super::message::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Link is down or the peer went away
    #[error("Disconnected")]
    Disconnected,

    /// Adapter cannot take more frames right now
    #[error("Transport busy: {0}")]
    Busy(String),

    /// Frame exceeds what the adapter can carry
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),
}

/// Opaque handle for one accepted send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SendHandle(pub u64);

impl fmt::Display for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Frames accepted
    pub frames_sent: u64,
    /// Cancel requests received
    pub cancels: u64,
    /// Send failures
    pub errors: u64,
}

/// Send/cancel capability of a link adapter
///
/// `send` is called from the inbound delivery path and must not block.
/// `cancel` must be safe on handles that already completed or were never
/// issued.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Queue one message for delivery
    fn send(&self, envelope: &Envelope, message: &[u8]) -> Result<SendHandle, TransportError>;

    /// Cancel a queued send, if it has not landed yet
    fn cancel(&self, handle: SendHandle);

    /// Get statistics
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }

    /// Short human readable description
    fn describe(&self) -> String {
        "transport".to_string()
    }
}
