//! Platform link backend trait and transport configuration

use crate::core::{PeerDescriptor, DEFAULT_MAX_PEERS, DEFAULT_SERVICE_NAME};
use crate::transport::{TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, possibly transient, platform handle for one remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Delivery guarantee requested for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    /// Ordered, retransmitted delivery
    Reliable,
    /// Best effort delivery
    Unreliable,
}

/// Platform abstraction for peer discovery and reliable links.
///
/// Implementations report asynchronous platform callbacks back into
/// [`PeerTransport`](crate::transport::PeerTransport); the trait itself only
/// carries the outgoing requests and must never block on network I/O.
pub trait LinkBackend: Send {
    /// Announce this device under `service_name`
    fn start_advertising(
        &mut self,
        service_name: &str,
        advertised_name: &str,
        descriptor: &PeerDescriptor,
    ) -> TransportResult<()>;

    /// Stop announcing this device
    fn stop_advertising(&mut self);

    /// Look for other devices announcing `service_name`
    fn start_browsing(&mut self, service_name: &str) -> TransportResult<()>;

    /// Stop looking for other devices
    fn stop_browsing(&mut self);

    /// Ask a discovered device to open a link, attaching our descriptor
    fn invite(&mut self, handle: LinkHandle, descriptor: &PeerDescriptor) -> TransportResult<()>;

    /// Queue `data` for every handle in `handles`
    fn send(&mut self, handles: &[LinkHandle], data: &[u8], reliability: Reliability) -> TransportResult<()>;

    /// Tear down a single link
    fn close(&mut self, handle: LinkHandle);

    /// Tear down every link and stop discovery
    fn shutdown(&mut self);
}

/// Transport configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Service name shared by every peer of the deployment
    pub service_name: String,
    /// Maximum concurrently linked or pending peers
    pub max_peers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

impl TransportConfig {
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Service names follow the DNS-SD service type rules: 1-15 characters,
    /// lowercase ASCII letters, digits and hyphens.
    pub fn validate(&self) -> TransportResult<()> {
        let name = &self.service_name;
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if name.is_empty() || name.len() > 15 || !valid_chars {
            return Err(TransportError::ConfigurationError {
                parameter: "service_name".to_string(),
                value: name.clone(),
            });
        }

        if self.max_peers == 0 || self.max_peers > 16 {
            return Err(TransportError::ConfigurationError {
                parameter: "max_peers".to_string(),
                value: self.max_peers.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_service_name_validation() {
        let mut config = TransportConfig::default();
        config.service_name = "UWB_Nav".to_string();
        assert!(config.validate().is_err());

        config.service_name = "a-very-long-service-name".to_string();
        assert!(config.validate().is_err());

        config.service_name = "uwb-2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_peers_validation() {
        let config = TransportConfig::default().with_max_peers(0);
        assert!(matches!(
            config.validate(),
            Err(TransportError::ConfigurationError { .. })
        ));
    }
}
