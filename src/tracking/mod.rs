//! Role-specific tracking
//!
//! Anchors track other anchors and navigators and decide when a
//! measurement campaign runs. Navigators track anchors and guide the user
//! towards the primary one. The [`Coordinator`] task ties both to the
//! transport, the ranging capability and the distance error tracker.

pub mod anchor;
pub mod coordinator;
pub mod events;
pub mod navigator;
pub mod peers;

pub use anchor::{AnchorTracker, CampaignChange};
pub use coordinator::{Coordinator, CoordinatorCommand, CoordinatorError, CoordinatorHandle, LinkEvent};
pub use events::TrackingEvent;
pub use navigator::{NavigatorTracker, VisualizationState, VisualizationUpdate};
pub use peers::PeerCollection;
