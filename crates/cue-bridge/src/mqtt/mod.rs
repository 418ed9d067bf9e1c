//! MQTT transport plumbing
//!
//! - `client`: the publish/subscribe seam used by the session
//! - `connection`: connection lifecycle and reconnect state machine

mod client;
mod connection;

pub use client::*;
pub use connection::*;
