//! Measurement campaigns and distance error against ground truth

pub mod ground_truth;
pub mod record;
pub mod statistics;
pub mod tracker;

pub use ground_truth::{GroundTruthEntry, GroundTruthTable};
pub use record::{MeasurementCampaign, MeasurementRecord, Participant};
pub use statistics::{AggregateStatistics, DistanceObservation};
pub use tracker::{spawn, DistanceErrorTracker, ErrorTrackerHandle, TrackerCommand};
