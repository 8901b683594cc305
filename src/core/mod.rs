//! Core types and constants for the ranging coordinator

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
