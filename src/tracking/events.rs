//! Events broadcast to UI subscribers

use crate::core::{Destination, PeerId, RangingSample, Role};
use crate::measurement::AggregateStatistics;
use crate::tracking::VisualizationState;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    PeerConnected {
        peer: PeerId,
        role: Role,
        display_name: String,
    },
    /// Link dropped, the peer stays visible until its grace period ends
    PeerDisconnected { peer: PeerId },
    PeerRemoved { peer: PeerId },
    DestinationChanged {
        peer: PeerId,
        destination: Destination,
    },
    Sample { peer: PeerId, sample: RangingSample },
    Statistics(AggregateStatistics),
    Visualization {
        target: Option<PeerId>,
        state: VisualizationState,
    },
    /// Primary target just became close and visible
    Haptic { target: PeerId },
    CampaignStarted {
        campaign_id: Option<Uuid>,
        participants: Vec<PeerId>,
    },
    CampaignEnded,
    /// User-facing message; persistent ones need user action to clear
    StatusMessage { message: String, persistent: bool },
    Stopped,
}
