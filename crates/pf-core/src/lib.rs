//! Portal Fusion core: device trust and secure pairing.
//!
//! This crate implements:
//! - Device identity and self-signed certificates with a trust store
//! - The PIN-confirmed pairing state machine
//! - Sliding-window rate limiting
//! - Post-pairing message protection
//! - Persistent storage abstraction

#![forbid(unsafe_code)]

// Core state machine
pub mod pairing;

// Services
pub mod certificate;
pub mod channel;
pub mod node;
pub mod maintenance;

// Infrastructure
pub mod store;
pub mod rate_limit;
pub mod config;

// Supporting modules
pub mod errors;
pub mod types;
pub mod messages;
pub mod harness;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod proptests;

pub use channel::{SecureChannel, SessionKey};
pub use errors::{CoreError, Result};
pub use node::PortalCore;
pub use pairing::{PairedDevice, PairingManager, PairingState};
