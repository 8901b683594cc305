//! Device status export
//!
//! The coordinator pushes a [`StatusSnapshot`] after every change. Exporters
//! must not block and swallow their own failures.

use crate::core::{ConnectionState, Destination, PeerId, Role};
use crate::measurement::AggregateStatistics;
use crate::tracking::VisualizationState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::trace;
use uuid::Uuid;

/// Per-peer entry of a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: PeerId,
    pub role: Role,
    pub display_name: String,
    pub destination: Option<Destination>,
    pub state: ConnectionState,
    /// Latest distance in meters
    pub distance: Option<f32>,
    /// Latest bearing in degrees
    pub azimuth_deg: Option<f32>,
}

/// Read-only view of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub device_id: PeerId,
    pub role: Role,
    pub display_name: String,
    pub destination: Option<Destination>,
    /// Navigator only: the anchor being guided towards
    pub selected_target: Option<PeerId>,
    /// 0.0 to 1.0, if the platform reports it
    pub battery_level: Option<f32>,
    pub connected_anchors: usize,
    pub connected_navigators: usize,
    pub peers: Vec<PeerStatus>,
    pub visualization: Option<VisualizationState>,
    pub statistics: Option<AggregateStatistics>,
    pub campaign_id: Option<Uuid>,
    pub timestamp_ms: u64,
}

/// Fire-and-forget consumer of status snapshots
pub trait StatusExporter: Send + Sync {
    fn push(&self, snapshot: StatusSnapshot);
}

/// Keeps the latest snapshot for a read-only status endpoint
#[derive(Debug, Clone, Default)]
pub struct SharedStatus {
    latest: Arc<RwLock<Option<StatusSnapshot>>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Latest snapshot as JSON, `null` before the first push
    pub fn to_json(&self) -> serde_json::Value {
        self.latest()
            .and_then(|snapshot| serde_json::to_value(snapshot).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

impl StatusExporter for SharedStatus {
    fn push(&self, snapshot: StatusSnapshot) {
        match self.latest.write() {
            Ok(mut latest) => *latest = Some(snapshot),
            Err(_) => trace!("status lock poisoned, snapshot dropped"),
        }
    }
}
