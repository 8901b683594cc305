//! Peer transport layer
//!
//! Discovers peers advertising a shared service name, applies the
//! role-compatibility policy, keeps a bounded set of reliable links and
//! delivers raw payloads to a subscriber.

pub mod backend;
pub mod error;
pub mod mock;
pub mod peer_transport;
pub mod policy;

pub use backend::{LinkBackend, LinkHandle, Reliability, TransportConfig};
pub use error::{RecoveryStrategy, TransportError, TransportResult};
pub use mock::{LinkCall, MockLinkBackend, MockLinkProbe};
pub use peer_transport::{PeerTransport, TransportEvent};
pub use policy::{LocalIdentity, PolicyDecision, RejectReason};
