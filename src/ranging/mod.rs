//! Ranging session lifecycle
//!
//! One [`RangingSession`] per connected peer, driven through
//! created → token-pending → active ⇄ suspended → invalidated by the
//! [`RangingSessionManager`].

pub mod capability;
pub mod manager;
pub mod session;

pub use capability::{
    MockRangingCapability, MockRangingProbe, RangingCall, RangingCapability, RangingConfiguration,
    RangingError, RangingEvent, RangingResult, RemovalReason,
};
pub use manager::{RangingSessionManager, SessionOutcome, TokenOutcome};
pub use session::{RangingSession, SessionState};
