//! Utility modules for configuration and logging

pub mod config;
pub mod logging;

pub use config::{CampaignConfig, ConfigError, ConfigurationManager, RangingConfig, TrackingConfig};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
