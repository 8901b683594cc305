//! Multi-peer ranging coordinator
//!
//! Discovers nearby devices, exchanges ranging tokens over a peer-to-peer
//! transport, keeps one ranging session per peer and, for fixed anchors,
//! records measured distances against surveyed ground truth.

pub mod api;
pub mod context;
pub mod core;
pub mod measurement;
pub mod processing;
pub mod ranging;
pub mod tracking;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{Destination, PeerDescriptor, PeerId, RangingSample, Role};
pub use api::{JsonLinesSink, MemorySink, PersistenceSink, SharedStatus, StatusExporter, StatusSnapshot};
pub use context::{AppContext, ProfileStore, StaticProfile};
pub use measurement::{DistanceErrorTracker, GroundTruthTable, MeasurementCampaign, MeasurementRecord};
pub use processing::DiscoveryToken;
pub use ranging::{RangingCapability, RangingError, RangingEvent};
pub use tracking::{Coordinator, CoordinatorError, CoordinatorHandle, LinkEvent, TrackingEvent};
pub use transport::{LinkBackend, LinkHandle, PeerTransport, TransportConfig, TransportError};
pub use utils::{init_logging, ConfigurationManager, TrackingConfig};
