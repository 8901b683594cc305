//! Campaign and record types handed to persistence

use crate::core::{now_ms, Destination, PeerId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device taking part in a campaign and its known position, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: PeerId,
    pub position: Option<Destination>,
}

/// One measurement campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementCampaign {
    #[serde(rename = "id")]
    pub campaign_id: Uuid,
    /// Milliseconds since epoch
    #[serde(rename = "created_at")]
    pub started_at_ms: u64,
    /// Sorted by id, one entry per device
    pub participants: Vec<Participant>,
    #[serde(rename = "ended_at", skip_serializing_if = "Option::is_none", default)]
    pub ended_at_ms: Option<u64>,
}

impl MeasurementCampaign {
    pub fn new<I>(participants: I) -> Self
    where
        I: IntoIterator<Item = (PeerId, Option<Destination>)>,
    {
        let mut campaign = Self {
            campaign_id: Uuid::new_v4(),
            started_at_ms: now_ms(),
            participants: Vec::new(),
            ended_at_ms: None,
        };
        for (id, position) in participants {
            campaign.upsert(id, position);
        }
        campaign
    }

    pub fn is_active(&self) -> bool {
        self.ended_at_ms.is_none()
    }

    pub fn position_of(&self, id: &PeerId) -> Option<Destination> {
        self.participants
            .iter()
            .find(|p| &p.id == id)
            .and_then(|p| p.position)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    /// Insert or update a participant, keeping the list sorted
    pub fn upsert(&mut self, id: PeerId, position: Option<Destination>) {
        match self.participants.binary_search_by(|p| p.id.cmp(&id)) {
            Ok(index) => self.participants[index].position = position,
            Err(index) => self.participants.insert(index, Participant { id, position }),
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| &p.id != id);
        self.participants.len() != before
    }
}

/// Distance measured between two devices, with error against ground truth
/// when both positions are known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub device_i: PeerId,
    pub device_j: PeerId,
    #[serde(rename = "d_hat")]
    pub measured_distance: f64,
    #[serde(rename = "d_true", skip_serializing_if = "Option::is_none", default)]
    pub ground_truth_distance: Option<f64>,
    /// d_hat - d_true
    #[serde(rename = "e", skip_serializing_if = "Option::is_none", default)]
    pub plain_error: Option<f64>,
    /// 2 * e / d_true
    #[serde(rename = "k", skip_serializing_if = "Option::is_none", default)]
    pub normalized_error: Option<f64>,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

impl MeasurementRecord {
    pub fn new(
        device_i: PeerId,
        device_j: PeerId,
        measured_distance: f64,
        ground_truth_distance: Option<f64>,
        timestamp_ms: u64,
    ) -> Self {
        let ground_truth_distance = ground_truth_distance.filter(|d| *d > 0.0);
        let plain_error = ground_truth_distance.map(|d_true| measured_distance - d_true);
        let normalized_error = ground_truth_distance
            .zip(plain_error)
            .map(|(d_true, e)| 2.0 * e / d_true);
        Self {
            device_i,
            device_j,
            measured_distance,
            ground_truth_distance,
            plain_error,
            normalized_error,
            timestamp_ms,
        }
    }

    pub fn has_ground_truth(&self) -> bool {
        self.ground_truth_distance.is_some()
    }
}
