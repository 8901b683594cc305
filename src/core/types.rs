//! Core data types shared by every layer of the ranging coordinator

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Role a device plays in the ranging network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Fixed device placed at a known destination
    Anchor,
    /// Mobile device guided towards an anchor
    Navigator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anchor => "anchor",
            Role::Navigator => "navigator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known fixed positions an anchor can be placed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Window,
    Kitchen,
    MeetingRoom,
}

impl Destination {
    /// The canonical destination set required for a full campaign
    pub const ALL: [Destination; 3] = [
        Destination::Window,
        Destination::Kitchen,
        Destination::MeetingRoom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Window => "window",
            Destination::Kitchen => "kitchen",
            Destination::MeetingRoom => "meeting_room",
        }
    }

    /// Wire code used by the destination-update frame
    pub fn code(&self) -> u8 {
        match self {
            Destination::Window => 1,
            Destination::Kitchen => 2,
            Destination::MeetingRoom => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Destination::Window),
            2 => Some(Destination::Kitchen),
            3 => Some(Destination::MeetingRoom),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "window" => Ok(Destination::Window),
            "kitchen" => Ok(Destination::Kitchen),
            "meeting_room" => Ok(Destination::MeetingRoom),
            other => Err(format!("unknown destination '{}'", other)),
        }
    }
}

/// Stable, role-qualified peer identifier such as `anchor-u42`.
///
/// Always built from typed descriptor fields, never parsed back apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(role: Role, user_id: &str) -> Self {
        PeerId(format!("{}-{}", role.as_str(), user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed identity exchanged during the connection handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Role of the remote device
    pub role: Role,
    /// Profile user identifier
    pub user_id: String,
    /// Human readable name shown in the UI
    pub display_name: String,
    /// Declared destination (anchors only, may be unknown)
    pub destination: Option<Destination>,
}

impl PeerDescriptor {
    pub fn new(role: Role, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            role,
            user_id: user_id.into(),
            display_name: display_name.into(),
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.role, &self.user_id)
    }

    /// Service-advertisement name derived from role and id
    pub fn advertised_name(&self) -> String {
        match self.destination {
            Some(destination) => format!("{} ({}, {})", self.display_name, self.role, destination),
            None => format!("{} ({})", self.display_name, self.role),
        }
    }
}

/// Lifecycle of a peer as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Link is up, no token exchanged yet
    Connected,
    /// Our discovery token has been shared
    TokenExchanged,
    /// Ranging session is producing samples
    Tracking,
    /// Link dropped, waiting for removal
    Disconnected,
}

/// One range measurement against a peer
#[derive(Debug, Clone, PartialEq)]
pub struct RangingSample {
    /// Distance in meters, if the capability could resolve it
    pub distance: Option<f32>,
    /// Unit direction vector towards the peer, if in field of view
    pub direction: Option<Vector3<f32>>,
    /// Milliseconds since epoch
    pub timestamp_ms: u64,
}

impl RangingSample {
    pub fn new(distance: Option<f32>, direction: Option<Vector3<f32>>) -> Self {
        Self {
            distance,
            direction,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_none() && self.direction.is_none()
    }

    /// Horizontal bearing towards the peer in degrees, 0 straight ahead
    pub fn azimuth_deg(&self) -> Option<f32> {
        self.direction
            .map(|d| d.x.atan2(-d.z).to_degrees())
    }

    /// Elevation towards the peer in degrees
    pub fn elevation_deg(&self) -> Option<f32> {
        self.direction.and_then(|d| {
            let norm = d.norm();
            if norm <= f32::EPSILON {
                None
            } else {
                Some((d.y / norm).clamp(-1.0, 1.0).asin().to_degrees())
            }
        })
    }
}

/// Connected remote device tracked by the coordinator
#[derive(Debug, Clone)]
pub struct Peer {
    pub descriptor: PeerDescriptor,
    pub connection_state: ConnectionState,
    /// Last lifecycle or sample update, ms since epoch
    pub last_update_ms: u64,
    pub last_sample: Option<RangingSample>,
}

impl Peer {
    pub fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            connection_state: ConnectionState::Connected,
            last_update_ms: now_ms(),
            last_sample: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.descriptor.peer_id()
    }

    pub fn role(&self) -> Role {
        self.descriptor.role
    }

    pub fn destination(&self) -> Option<Destination> {
        self.descriptor.destination
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state != ConnectionState::Disconnected
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_update_ms = now_ms();
    }

    pub fn last_distance(&self) -> Option<f32> {
        self.last_sample.as_ref().and_then(|s| s.distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_role_qualified() {
        let descriptor = PeerDescriptor::new(Role::Anchor, "u42", "Window Anchor");
        assert_eq!(descriptor.peer_id().as_str(), "anchor-u42");
        assert_ne!(
            PeerId::new(Role::Navigator, "u42"),
            PeerId::new(Role::Anchor, "u42")
        );
    }

    #[test]
    fn test_destination_codes_round_trip() {
        for destination in Destination::ALL {
            assert_eq!(Destination::from_code(destination.code()), Some(destination));
            assert_eq!(destination.as_str().parse::<Destination>(), Ok(destination));
        }
        assert_eq!(Destination::from_code(0), None);
    }

    #[test]
    fn test_sample_angles() {
        let ahead = RangingSample::new(Some(1.0), Some(Vector3::new(0.0, 0.0, -1.0)));
        assert!(ahead.azimuth_deg().unwrap().abs() < 1e-4);
        assert!(ahead.elevation_deg().unwrap().abs() < 1e-4);

        let right = RangingSample::new(Some(1.0), Some(Vector3::new(1.0, 0.0, 0.0)));
        assert!((right.azimuth_deg().unwrap() - 90.0).abs() < 1e-3);

        let blind = RangingSample::new(Some(1.0), None);
        assert!(blind.azimuth_deg().is_none());
        assert!(!blind.is_empty());
        assert!(RangingSample::new(None, None).is_empty());
    }
}
