//! Surveyed distances between fixed destinations

use crate::core::constants::{KITCHEN_MEETING_ROOM_M, WINDOW_KITCHEN_M, WINDOW_MEETING_ROOM_M};
use crate::core::Destination;
use crate::utils::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Known distance between two destinations (meters)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthEntry {
    pub position_a: Destination,
    pub position_b: Destination,
    pub distance_meters: f64,
}

impl GroundTruthEntry {
    pub fn new(position_a: Destination, position_b: Destination, distance_meters: f64) -> Self {
        Self {
            position_a,
            position_b,
            distance_meters,
        }
    }

    fn key(&self) -> (Destination, Destination) {
        pair_key(self.position_a, self.position_b)
    }

    fn matches(&self, a: Destination, b: Destination) -> bool {
        self.key() == pair_key(a, b)
    }
}

fn pair_key(a: Destination, b: Destination) -> (Destination, Destination) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Symmetric lookup table with one entry per unordered destination pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroundTruthTable {
    entries: Vec<GroundTruthEntry>,
}

impl Default for GroundTruthTable {
    fn default() -> Self {
        Self::canonical()
    }
}

impl GroundTruthTable {
    pub fn new(entries: Vec<GroundTruthEntry>) -> Self {
        Self { entries }
    }

    /// The three surveyed office positions
    pub fn canonical() -> Self {
        Self::new(vec![
            GroundTruthEntry::new(Destination::Window, Destination::Kitchen, WINDOW_KITCHEN_M),
            GroundTruthEntry::new(Destination::Window, Destination::MeetingRoom, WINDOW_MEETING_ROOM_M),
            GroundTruthEntry::new(Destination::Kitchen, Destination::MeetingRoom, KITCHEN_MEETING_ROOM_M),
        ])
    }

    pub fn entries(&self) -> &[GroundTruthEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distance between two destinations in either order
    pub fn lookup(&self, a: Destination, b: Destination) -> Option<f64> {
        if a == b {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.matches(a, b))
            .map(|entry| entry.distance_meters)
    }

    /// Reject self pairs, non-positive distances and duplicate pairs
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.position_a == entry.position_b {
                return Err(ConfigError::InvalidParameter {
                    parameter: "ground_truth".to_string(),
                    value: entry.position_a.to_string(),
                    reason: "pair must join two different destinations".to_string(),
                });
            }
            if !entry.distance_meters.is_finite() || entry.distance_meters <= 0.0 {
                return Err(ConfigError::InvalidParameter {
                    parameter: "ground_truth".to_string(),
                    value: entry.distance_meters.to_string(),
                    reason: "distance must be positive".to_string(),
                });
            }
            if !seen.insert(entry.key()) {
                return Err(ConfigError::InvalidParameter {
                    parameter: "ground_truth".to_string(),
                    value: format!("{}/{}", entry.position_a, entry.position_b),
                    reason: "duplicate pair".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Every pair of `required` destinations has an entry
    pub fn covers(&self, required: &[Destination]) -> bool {
        required.iter().enumerate().all(|(i, a)| {
            required[i + 1..]
                .iter()
                .all(|b| a == b || self.lookup(*a, *b).is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_lookup() {
        let table = GroundTruthTable::canonical();
        assert_eq!(table.lookup(Destination::Window, Destination::Kitchen), Some(10.287));
        assert_eq!(table.lookup(Destination::Kitchen, Destination::Window), Some(10.287));
        assert_eq!(table.lookup(Destination::MeetingRoom, Destination::Kitchen), Some(6.187));
        assert_eq!(table.lookup(Destination::Window, Destination::MeetingRoom), Some(5.587));
        assert_eq!(table.lookup(Destination::MeetingRoom, Destination::Window), Some(5.587));
        assert_eq!(table.lookup(Destination::Window, Destination::Window), None);
    }

    #[test]
    fn test_canonical_table_is_valid() {
        let table = GroundTruthTable::canonical();
        assert!(table.validate().is_ok());
        assert!(table.covers(&Destination::ALL));
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let table = GroundTruthTable::new(vec![
            GroundTruthEntry::new(Destination::Window, Destination::Kitchen, 10.0),
            GroundTruthEntry::new(Destination::Kitchen, Destination::Window, 10.5),
        ]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let self_pair = GroundTruthTable::new(vec![GroundTruthEntry::new(
            Destination::Window,
            Destination::Window,
            1.0,
        )]);
        assert!(self_pair.validate().is_err());

        let negative = GroundTruthTable::new(vec![GroundTruthEntry::new(
            Destination::Window,
            Destination::Kitchen,
            -2.0,
        )]);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_partial_table_coverage() {
        let table = GroundTruthTable::new(vec![GroundTruthEntry::new(
            Destination::Window,
            Destination::Kitchen,
            10.287,
        )]);
        assert!(table.covers(&[Destination::Window, Destination::Kitchen]));
        assert!(!table.covers(&Destination::ALL));
    }

    #[test]
    fn test_table_serializes_as_list() {
        let table = GroundTruthTable::canonical();
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json.as_array().map(|a| a.len()), Some(3));
        assert_eq!(json[0]["position_b"], "kitchen");
    }
}
