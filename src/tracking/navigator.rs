//! Navigator-role tracking: anchors in range and guidance towards one of them

use crate::core::{Destination, Peer, PeerId, RangingSample};
use crate::tracking::{CampaignChange, PeerCollection};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the UI can show about the primary target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationState {
    #[default]
    Unknown,
    OutOfFieldOfView,
    CloseAndVisible,
    FarAndVisible,
}

impl VisualizationState {
    /// Classify a sample, rules checked in order
    pub fn classify(sample: Option<&RangingSample>, near_threshold_m: f32) -> Self {
        let Some(sample) = sample else {
            return VisualizationState::Unknown;
        };
        match (sample.distance, sample.direction) {
            (None, None) => VisualizationState::Unknown,
            (_, None) => VisualizationState::OutOfFieldOfView,
            (Some(distance), Some(_)) if distance < near_threshold_m => VisualizationState::CloseAndVisible,
            _ => VisualizationState::FarAndVisible,
        }
    }
}

/// Result of re-evaluating the visualization
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationUpdate {
    pub target: Option<PeerId>,
    pub state: VisualizationState,
    /// Set on the transition into [`VisualizationState::CloseAndVisible`]
    pub haptic: bool,
}

#[derive(Debug)]
pub struct NavigatorTracker {
    local: PeerId,
    anchors: PeerCollection,
    selected: Option<PeerId>,
    near_threshold_m: f32,
    min_campaign_anchors: usize,
    visualization: VisualizationState,
    target: Option<PeerId>,
    campaign_active: bool,
}

impl NavigatorTracker {
    pub fn new(local: PeerId, max_timeout_retries: u32, near_threshold_m: f32, min_campaign_anchors: usize) -> Self {
        Self {
            local,
            anchors: PeerCollection::new("anchors", max_timeout_retries),
            selected: None,
            near_threshold_m,
            min_campaign_anchors,
            visualization: VisualizationState::Unknown,
            target: None,
            campaign_active: false,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn anchors(&self) -> &PeerCollection {
        &self.anchors
    }

    pub fn anchors_mut(&mut self) -> &mut PeerCollection {
        &mut self.anchors
    }

    pub fn selected(&self) -> Option<&PeerId> {
        self.selected.as_ref()
    }

    pub fn select(&mut self, anchor: Option<PeerId>) {
        debug!(anchor = ?anchor.as_ref().map(|a| a.as_str()), "anchor selection changed");
        self.selected = anchor;
    }

    pub fn visualization(&self) -> VisualizationState {
        self.visualization
    }

    pub fn is_campaign_active(&self) -> bool {
        self.campaign_active
    }

    /// The selected anchor when one is chosen, otherwise the first connected
    pub fn primary(&self) -> Option<&Peer> {
        match &self.selected {
            Some(selected) => self.anchors.get(selected).filter(|p| p.is_connected()),
            None => self.anchors.first_connected(),
        }
    }

    /// Recompute the visualization from the primary's latest sample. Returns
    /// an update when the state or target changed.
    pub fn update_visualization(&mut self) -> Option<VisualizationUpdate> {
        let (target, state) = match self.primary() {
            Some(primary) => (
                Some(primary.id()),
                VisualizationState::classify(primary.last_sample.as_ref(), self.near_threshold_m),
            ),
            None => (None, VisualizationState::Unknown),
        };

        if state == self.visualization && target == self.target {
            return None;
        }

        let haptic = state == VisualizationState::CloseAndVisible
            && (self.visualization != VisualizationState::CloseAndVisible || target != self.target);
        self.visualization = state;
        self.target = target.clone();
        Some(VisualizationUpdate { target, state, haptic })
    }

    /// Start with enough anchors in range, end once too few remain
    pub fn evaluate_campaign(&mut self) -> Option<CampaignChange> {
        let connected: Vec<(PeerId, Option<Destination>)> = self
            .anchors
            .connected()
            .map(|p| (p.id(), p.destination()))
            .collect();

        if !self.campaign_active && connected.len() >= self.min_campaign_anchors {
            self.campaign_active = true;
            let mut participants = connected;
            participants.push((self.local.clone(), None));
            return Some(CampaignChange::Start(participants));
        }
        if self.campaign_active && connected.len() < self.min_campaign_anchors {
            self.campaign_active = false;
            return Some(CampaignChange::End);
        }
        None
    }

    pub fn reset_campaign(&mut self) {
        self.campaign_active = false;
    }
}
