//! Wire-level processing of peer payloads

pub mod token;

pub use token::{decode, encode, share, DecodeError, DiscoveryToken, EncodeError, WireMessage};
