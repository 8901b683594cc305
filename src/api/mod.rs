//! Outward-facing collaborators: status export and record persistence

pub mod persistence;
pub mod status;

pub use persistence::{JsonLinesSink, MemorySink, PersistenceError, PersistenceResult, PersistenceSink};
pub use status::{PeerStatus, SharedStatus, StatusExporter, StatusSnapshot};
