//! Transport error types and recovery hints

use thiserror::Error;

/// Errors raised by the peer transport layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Send or close against a peer without a live link
    #[error("peer {peer} is not connected")]
    PeerNotConnected { peer: String },
    /// Link attempt rejected by the acceptance policy
    #[error("connection to {peer} refused: {reason}")]
    ConnectionRefused { peer: String, reason: String },
    /// Concurrent peer limit reached
    #[error("peer capacity exceeded ({connected}/{max})")]
    CapacityExceeded { connected: usize, max: usize },
    /// Established link went away
    #[error("link to {peer} dropped")]
    LinkDropped { peer: String },
    /// Advertising or browsing could not be started
    #[error("discovery failed: {details}")]
    DiscoveryFailed { details: String },
    /// Platform refused to queue the payload
    #[error("send failed: {details}")]
    SendFailed { details: String },
    /// Transport configuration rejected
    #[error("configuration error: invalid {parameter} = {value}")]
    ConfigurationError { parameter: String, value: String },
    /// Transport was disconnected
    #[error("transport is closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Recovery strategy for transport failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryStrategy {
    /// Retry on the next opportunity
    Retry,
    /// Restart advertising and browsing
    Rediscover,
    /// Drop the operation and continue
    Skip,
    /// Give up permanently
    Fail,
}

impl TransportError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            TransportError::PeerNotConnected { .. } => RecoveryStrategy::Skip,
            TransportError::ConnectionRefused { .. } => RecoveryStrategy::Skip,
            TransportError::CapacityExceeded { .. } => RecoveryStrategy::Rediscover,
            TransportError::LinkDropped { .. } => RecoveryStrategy::Rediscover,
            TransportError::DiscoveryFailed { .. } => RecoveryStrategy::Rediscover,
            TransportError::SendFailed { .. } => RecoveryStrategy::Retry,
            TransportError::ConfigurationError { .. } => RecoveryStrategy::Fail,
            TransportError::Closed => RecoveryStrategy::Fail,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.recovery_strategy(), RecoveryStrategy::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_strategies() {
        let dropped = TransportError::LinkDropped { peer: "anchor-a".into() };
        assert_eq!(dropped.recovery_strategy(), RecoveryStrategy::Rediscover);
        assert!(dropped.is_recoverable());

        let config = TransportError::ConfigurationError {
            parameter: "max_peers".into(),
            value: "0".into(),
        };
        assert!(!config.is_recoverable());
        assert!(!TransportError::Closed.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::CapacityExceeded { connected: 8, max: 8 };
        assert_eq!(err.to_string(), "peer capacity exceeded (8/8)");
    }
}
