use crate::core::constants::{
    DEFAULT_MAX_TIMEOUT_RETRIES, DEFAULT_RECORD_INTERVAL_MS, DEFAULT_REMOVAL_GRACE_MS,
    DEFAULT_SAMPLE_MAX_AGE_MS, NEAR_THRESHOLD_M,
};
use crate::core::Destination;
use crate::measurement::GroundTruthTable;
use crate::transport::TransportConfig;
use crate::utils::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ranging session and tracking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangingConfig {
    /// Re-arm attempts after a timeout before the session is replaced
    pub max_timeout_retries: u32,
    /// Distance below which a visible anchor counts as close (meters)
    pub near_threshold_m: f32,
    /// Delay before a disconnected peer leaves the active sets (milliseconds, 0 = immediate)
    pub removal_grace_ms: u64,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            max_timeout_retries: DEFAULT_MAX_TIMEOUT_RETRIES,
            near_threshold_m: NEAR_THRESHOLD_M,
            removal_grace_ms: DEFAULT_REMOVAL_GRACE_MS,
        }
    }
}

/// Measurement campaign parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Interval between record snapshots (milliseconds)
    pub record_interval_ms: u64,
    /// Samples older than this are skipped by a snapshot (milliseconds)
    pub sample_max_age_ms: u64,
    /// Destinations that must all be present before an anchor starts a campaign
    pub required_destinations: Vec<Destination>,
    /// Navigator campaigns start once this many anchors are connected
    pub min_navigator_anchors: usize,
    /// Newline-delimited JSON output for records, none keeps them in memory
    pub output_path: Option<PathBuf>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            record_interval_ms: DEFAULT_RECORD_INTERVAL_MS,
            sample_max_age_ms: DEFAULT_SAMPLE_MAX_AGE_MS,
            required_destinations: Destination::ALL.to_vec(),
            min_navigator_anchors: 2,
            output_path: None,
        }
    }
}

/// Complete configuration of a tracking device
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub transport: TransportConfig,
    pub ranging: RangingConfig,
    pub campaign: CampaignConfig,
    pub logging: LogConfig,
    pub ground_truth: GroundTruthTable,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Invalid parameter value
    #[error("invalid {parameter} = {value}: {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },
    /// Missing required parameter
    #[error("missing parameter: {parameter}")]
    MissingParameter { parameter: String },
    /// Configuration file I/O error
    #[error("I/O error: {message}")]
    IoError { message: String },
    /// JSON serialization/deserialization error
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

fn invalid(parameter: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl TrackingConfig {
    /// Check every section, returning the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate().map_err(|error| match error {
            crate::transport::TransportError::ConfigurationError { parameter, value } => {
                invalid(&format!("transport.{}", parameter), value, "rejected by transport")
            }
            other => invalid("transport", other, "rejected by transport"),
        })?;

        if !self.ranging.near_threshold_m.is_finite() || self.ranging.near_threshold_m <= 0.0 {
            return Err(invalid(
                "ranging.near_threshold_m",
                self.ranging.near_threshold_m,
                "threshold must be positive",
            ));
        }

        if self.campaign.record_interval_ms == 0 {
            return Err(invalid("campaign.record_interval_ms", 0, "interval must be positive"));
        }
        if self.campaign.sample_max_age_ms == 0 {
            return Err(invalid("campaign.sample_max_age_ms", 0, "maximum age must be positive"));
        }
        if self.campaign.min_navigator_anchors < 2 {
            return Err(invalid(
                "campaign.min_navigator_anchors",
                self.campaign.min_navigator_anchors,
                "a campaign needs at least two anchors",
            ));
        }
        if self.campaign.required_destinations.is_empty() {
            return Err(ConfigError::MissingParameter {
                parameter: "campaign.required_destinations".to_string(),
            });
        }

        self.ground_truth.validate()?;
        if !self.ground_truth.covers(&self.campaign.required_destinations) {
            return Err(invalid(
                "ground_truth",
                format!("{} entries", self.ground_truth.len()),
                "every pair of required destinations needs a surveyed distance",
            ));
        }

        Ok(())
    }
}

/// Loads, validates and persists a [`TrackingConfig`]
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    config: TrackingConfig,
    /// Configuration file path
    config_file_path: Option<PathBuf>,
    /// Whether configuration has been modified since the last load or save
    is_modified: bool,
}

impl ConfigurationManager {
    /// Create a configuration manager with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration manager and load from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut manager = Self::new();
        manager.load_from_file(path)?;
        Ok(manager)
    }

    pub fn get_config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Replace the whole configuration after validating it
    pub fn update_config(&mut self, config: TrackingConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        self.is_modified = true;
        Ok(())
    }

    /// Load configuration from a JSON file; missing sections take defaults
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        let config: TrackingConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::SerializationError {
                message: format!("Failed to parse config file '{}': {}", path.display(), e),
            })?;
        config.validate()?;

        self.config = config;
        self.config_file_path = Some(path.to_path_buf());
        self.is_modified = false;
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.config).map_err(|e| {
            ConfigError::SerializationError {
                message: format!("Failed to serialize config: {}", e),
            }
        })?;

        fs::write(path, content).map_err(|e| ConfigError::IoError {
            message: format!("Failed to write config file '{}': {}", path.display(), e),
        })?;

        self.config_file_path = Some(path.to_path_buf());
        self.is_modified = false;
        Ok(())
    }

    /// Save to the currently loaded file path
    pub fn save(&mut self) -> Result<(), ConfigError> {
        match self.config_file_path.clone() {
            Some(path) => self.save_to_file(path),
            None => Err(ConfigError::IoError {
                message: "No file path set for saving configuration".to_string(),
            }),
        }
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    /// Update the snapshot interval, returning the previous value
    pub fn set_record_interval(&mut self, interval_ms: u64) -> Result<u64, ConfigError> {
        if interval_ms < 100 {
            return Err(invalid(
                "campaign.record_interval_ms",
                interval_ms,
                "interval too short for batched persistence",
            ));
        }
        let old_value = self.config.campaign.record_interval_ms;
        self.config.campaign.record_interval_ms = interval_ms;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Update the near threshold, returning the previous value
    pub fn set_near_threshold(&mut self, threshold_m: f32) -> Result<f32, ConfigError> {
        if !threshold_m.is_finite() || threshold_m <= 0.0 {
            return Err(invalid("ranging.near_threshold_m", threshold_m, "threshold must be positive"));
        }
        let old_value = self.config.ranging.near_threshold_m;
        self.config.ranging.near_threshold_m = threshold_m;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Update the peer limit, returning the previous value
    pub fn set_max_peers(&mut self, max_peers: usize) -> Result<usize, ConfigError> {
        let candidate = self.config.transport.clone().with_max_peers(max_peers);
        if candidate.validate().is_err() {
            return Err(invalid("transport.max_peers", max_peers, "must be between 1 and 16"));
        }
        let old_value = self.config.transport.max_peers;
        self.config.transport = candidate;
        self.is_modified = true;
        Ok(old_value)
    }

    /// Replace the ground-truth table if it still covers the required destinations
    pub fn set_ground_truth(&mut self, table: GroundTruthTable) -> Result<(), ConfigError> {
        table.validate()?;
        if !table.covers(&self.config.campaign.required_destinations) {
            return Err(invalid(
                "ground_truth",
                format!("{} entries", table.len()),
                "every pair of required destinations needs a surveyed distance",
            ));
        }
        self.config.ground_truth = table;
        self.is_modified = true;
        Ok(())
    }
}
