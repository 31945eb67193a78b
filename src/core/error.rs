//! Bus error taxonomy
//!
//! Every layer above the transport reports failures as [`BusError`].
//! Errors that cross the wire are squeezed into the one-byte
//! [`OperationStatus`] and expanded again on the other side.

use super::message::OperationStatus;
use super::transport::TransportError;
use thiserror::Error;

/// Bus error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Malformed, short or oversized frame
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Remote protocol version cannot be served locally
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Duplicate route, filter or protocol registration
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Route, device, connection or operation lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Id pool or table capacity exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No response within the deadline
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Protocol still referenced by live connections
    #[error("In use: {0}")]
    InUse(String),

    /// Operation aborted because its connection went away
    #[error("Operation canceled")]
    Canceled,

    /// Send attempted on a connection that is not enabled
    #[error("Not connected")]
    NotConnected,

    /// Peer answered with a non-zero result
    #[error("Remote error: {0}")]
    Remote(OperationStatus),

    /// Illegal state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transport adapter failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BusError {
    /// Wire status reported to a peer for this error
    pub fn status(&self) -> OperationStatus {
        match self {
            Self::InvalidMessage(_) => OperationStatus::Overflow,
            Self::Unsupported(_) => OperationStatus::ProtocolBad,
            Self::AlreadyExists(_) | Self::InvalidState(_) => OperationStatus::Invalid,
            Self::NotFound(_) => OperationStatus::Nonexistent,
            Self::ResourceExhausted(_) => OperationStatus::NoMemory,
            Self::Timeout(_) => OperationStatus::Timeout,
            Self::InUse(_) => OperationStatus::Retry,
            Self::Canceled => OperationStatus::Interrupted,
            Self::NotConnected => OperationStatus::Nonexistent,
            Self::Remote(status) => *status,
            Self::Transport(_) => OperationStatus::UnknownError,
        }
    }

    /// Is this a timeout?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<OperationStatus> for BusError {
    fn from(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Success => Self::InvalidState("success is not an error".to_string()),
            OperationStatus::Timeout => Self::Remote(OperationStatus::Timeout),
            OperationStatus::NoMemory => {
                Self::ResourceExhausted("peer out of memory".to_string())
            }
            OperationStatus::ProtocolBad => Self::Unsupported("peer rejected protocol".to_string()),
            OperationStatus::Nonexistent => Self::NotFound("peer reports nonexistent".to_string()),
            other => Self::Remote(other),
        }
    }
}

/// Result alias used throughout the bus core
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BusError::Timeout(500).status(), OperationStatus::Timeout);
        assert_eq!(BusError::NotFound("x".into()).status(), OperationStatus::Nonexistent);
        assert_eq!(
            BusError::Remote(OperationStatus::Malfunction).status(),
            OperationStatus::Malfunction
        );
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(BusError::from(OperationStatus::Invalid), BusError::Remote(OperationStatus::Invalid)));
        assert!(matches!(BusError::from(OperationStatus::NoMemory), BusError::ResourceExhausted(_)));
        assert!(matches!(BusError::from(OperationStatus::ProtocolBad), BusError::Unsupported(_)));
    }

    #[test]
    fn test_transport_conversion() {
        let err: BusError = TransportError::Disconnected.into();
        assert!(matches!(err, BusError::Transport(TransportError::Disconnected)));
        assert_eq!(err.status(), OperationStatus::UnknownError);
    }
}
