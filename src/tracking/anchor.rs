//! Anchor-role tracking: peer anchors, peer navigators and campaign readiness

use crate::core::{Destination, Peer, PeerId, Role};
use crate::measurement::{AggregateStatistics, DistanceObservation, GroundTruthTable};
use crate::tracking::PeerCollection;
use std::collections::BTreeSet;
use tracing::debug;

/// Campaign transition decided by a role tracker
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignChange {
    /// Start with these participants and their known positions
    Start(Vec<(PeerId, Option<Destination>)>),
    End,
}

#[derive(Debug)]
pub struct AnchorTracker {
    local: PeerId,
    destination: Option<Destination>,
    anchors: PeerCollection,
    navigators: PeerCollection,
    required: BTreeSet<Destination>,
    ground_truth: GroundTruthTable,
    statistics: AggregateStatistics,
    campaign_active: bool,
}

impl AnchorTracker {
    pub fn new(
        local: PeerId,
        destination: Option<Destination>,
        required: &[Destination],
        ground_truth: GroundTruthTable,
        max_timeout_retries: u32,
    ) -> Self {
        Self {
            local,
            destination,
            anchors: PeerCollection::new("anchors", max_timeout_retries),
            navigators: PeerCollection::new("navigators", max_timeout_retries),
            required: required.iter().copied().collect(),
            ground_truth,
            statistics: AggregateStatistics::default(),
            campaign_active: false,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn destination(&self) -> Option<Destination> {
        self.destination
    }

    pub fn set_destination(&mut self, destination: Option<Destination>) {
        self.destination = destination;
    }

    pub fn anchors(&self) -> &PeerCollection {
        &self.anchors
    }

    pub fn navigators(&self) -> &PeerCollection {
        &self.navigators
    }

    /// Collection holding peers of `role`
    pub fn collection_mut(&mut self, role: Role) -> &mut PeerCollection {
        match role {
            Role::Anchor => &mut self.anchors,
            Role::Navigator => &mut self.navigators,
        }
    }

    /// Collection currently tracking `peer`
    pub fn collection_of(&mut self, peer: &PeerId) -> Option<&mut PeerCollection> {
        if self.anchors.contains(peer) {
            Some(&mut self.anchors)
        } else if self.navigators.contains(peer) {
            Some(&mut self.navigators)
        } else {
            None
        }
    }

    pub fn statistics(&self) -> &AggregateStatistics {
        &self.statistics
    }

    pub fn is_campaign_active(&self) -> bool {
        self.campaign_active
    }

    fn expected_distance(&self, peer: &Peer) -> Option<f64> {
        self.ground_truth.lookup(self.destination?, peer.destination()?)
    }

    /// Recompute the multi-anchor means over anchors with a known destination
    pub fn recompute_statistics(&mut self) -> &AggregateStatistics {
        let observations: Vec<DistanceObservation> = self
            .anchors
            .connected()
            .filter_map(|peer| {
                Some(DistanceObservation {
                    measured: f64::from(peer.last_distance()?),
                    expected: self.expected_distance(peer)?,
                })
            })
            .collect();
        self.statistics = AggregateStatistics::from_observations(&observations);
        &self.statistics
    }

    /// Self plus connected anchors with a known destination
    pub fn positioned_participants(&self) -> Vec<(PeerId, Option<Destination>)> {
        let mut participants: Vec<(PeerId, Option<Destination>)> = self
            .anchors
            .connected()
            .filter(|peer| peer.destination().is_some())
            .map(|peer| (peer.id(), peer.destination()))
            .collect();
        if self.destination.is_some() {
            participants.push((self.local.clone(), self.destination));
        }
        participants
    }

    /// Every required destination is held by this device or a connected anchor
    pub fn required_set_present(&self) -> bool {
        let present: BTreeSet<Destination> = self
            .positioned_participants()
            .into_iter()
            .filter_map(|(_, destination)| destination)
            .collect();
        self.required.is_subset(&present)
    }

    /// Start once the required set is complete, end when it breaks
    pub fn evaluate_campaign(&mut self) -> Option<CampaignChange> {
        let complete = self.required_set_present();
        if complete && !self.campaign_active {
            self.campaign_active = true;
            let participants = self.positioned_participants();
            debug!(participants = participants.len(), "required anchor set present");
            return Some(CampaignChange::Start(participants));
        }
        if !complete && self.campaign_active {
            self.campaign_active = false;
            debug!("required anchor set broken");
            return Some(CampaignChange::End);
        }
        None
    }

    pub fn reset_campaign(&mut self) {
        self.campaign_active = false;
    }
}
