//! cue-bridge - lighting SDK to MQTT bridge
//!
//! Exposes every RGB lighting device reported by the vendor SDK, plus an
//! "all devices" aggregate light and a control-priority switch, as Home
//! Assistant MQTT entities:
//! - Device snapshots and colour averaging
//! - Registry of entities and their topics
//! - Discovery, state and command payloads
//! - Broker connection lifecycle with reconnect
//! - Command handling in a single session task

// Shared error type
pub mod types;

// Configuration file and environment overrides
pub mod config;

// Device snapshot and RGB colour
pub mod device;

// Entity registry
pub mod registry;

// Home Assistant payloads
pub mod discovery;

// Vendor lighting SDK seam
pub mod sdk;

// MQTT client and connection lifecycle
pub mod mqtt;

// Bridge session
pub mod session;

pub use types::{Error, Result};
