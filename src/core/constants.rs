//! System parameters and defaults

/// Service name peers advertise and browse for
pub const DEFAULT_SERVICE_NAME: &str = "uwb-nav";

/// Distance below which a visible anchor counts as close (meters)
pub const NEAR_THRESHOLD_M: f32 = 0.3;

/// Maximum concurrently linked peers
pub const DEFAULT_MAX_PEERS: usize = 8;

/// Interval between measurement record snapshots (milliseconds)
pub const DEFAULT_RECORD_INTERVAL_MS: u64 = 3000;

/// Samples older than this are left out of a snapshot (milliseconds)
pub const DEFAULT_SAMPLE_MAX_AGE_MS: u64 = 10_000;

/// Re-arm attempts after a ranging timeout before giving up
pub const DEFAULT_MAX_TIMEOUT_RETRIES: u32 = 3;

/// Delay before a disconnected peer is dropped from the UI (milliseconds)
pub const DEFAULT_REMOVAL_GRACE_MS: u64 = 1500;

/// Surveyed window to kitchen distance (meters)
pub const WINDOW_KITCHEN_M: f64 = 10.287;

/// Surveyed window to meeting room distance (meters)
pub const WINDOW_MEETING_ROOM_M: f64 = 5.587;

/// Surveyed kitchen to meeting room distance (meters)
pub const KITCHEN_MEETING_ROOM_M: f64 = 6.187;
