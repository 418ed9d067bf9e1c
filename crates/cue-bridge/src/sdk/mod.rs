//! Lighting SDK
//!
//! The vendor lighting SDK is consumed through the [`LightingSdk`] trait.
//! Calls are synchronous and fast; every mutating call is followed by a
//! [`LightingSdk::last_error`] check at the call site.
//!
//! [`VirtualSdk`] is an in-memory backend used when no vendor runtime is
//! linked in, and by the tests.

mod virtual_sdk;

pub use virtual_sdk::*;

use std::time::Duration;

use tracing::{error, info, warn};

use crate::device::{DeviceSnapshot, Rgb};
use crate::types::{Error, Result};

/// Layer priority that puts the bridge above the vendor software's own layer
pub const CONTROL_PRIORITY: u32 = 130;

/// Layer priority that hands lighting back to the vendor software
pub const YIELD_PRIORITY: u32 = 126;

// ─────────────────────────────────────────────────────────────────────────────
// Error Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Last-error value reported by the SDK after each call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorCode {
    #[default]
    Success,
    /// The vendor software is not running
    ServerNotFound,
    /// Another client holds exclusive control
    NoControl,
    /// A call was made before the handshake
    ProtocolHandshakeMissing,
    IncompatibleProtocol,
    InvalidArguments,
}

impl ErrorCode {
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Success => write!(f, "success"),
            ErrorCode::ServerNotFound => write!(f, "server not found"),
            ErrorCode::NoControl => write!(f, "no control"),
            ErrorCode::ProtocolHandshakeMissing => write!(f, "protocol handshake missing"),
            ErrorCode::IncompatibleProtocol => write!(f, "incompatible protocol"),
            ErrorCode::InvalidArguments => write!(f, "invalid arguments"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SDK Types
// ─────────────────────────────────────────────────────────────────────────────

/// Result of the protocol handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDetails {
    pub sdk_version: String,
    pub server_version: String,
    /// 0 when the server could not be reached
    pub server_protocol_version: u32,
    /// Set when client and server protocols cannot talk to each other
    pub breaking_changes: bool,
}

/// A device as enumerated by the SDK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkDevice {
    pub model: String,
    /// Current colour of every LED
    pub colors: Vec<Rgb>,
}

/// Capability surface of the vendor lighting SDK
pub trait LightingSdk: Send + Sync {
    /// Negotiate protocol versions with the vendor software
    fn perform_handshake(&mut self) -> ProtocolDetails;

    fn request_exclusive_control(&mut self) -> bool;

    fn release_control(&mut self) -> bool;

    /// Enumerate devices in SDK order; the position is the device index
    fn list_devices(&self) -> Vec<SdkDevice>;

    /// Current per-LED colours of one device
    fn get_device_colors(&self, index: usize) -> Option<Vec<Rgb>>;

    /// Set every LED of one device to a colour
    fn set_device_color(&mut self, index: usize, color: Rgb) -> bool;

    fn set_layer_priority(&mut self, priority: u32) -> bool;

    /// Error code of the most recent call
    fn last_error(&self) -> ErrorCode;
}

/// Log the SDK's last error if the previous call failed.
///
/// Returns `true` on success.
pub fn check_last_error(sdk: &dyn LightingSdk, operation: &str) -> bool {
    let code = sdk.last_error();
    if code.is_success() {
        true
    } else {
        error!(operation, error = %code, "Lighting SDK call failed");
        false
    }
}

/// Handshake with the vendor software and optionally take exclusive control.
///
/// While the server cannot be reached the handshake is retried every
/// `retry_delay`. An incompatible protocol is fatal.
pub async fn initialize(
    sdk: &mut dyn LightingSdk,
    exclusive_control: bool,
    retry_delay: Duration,
) -> Result<ProtocolDetails> {
    let details = loop {
        let details = sdk.perform_handshake();
        let code = sdk.last_error();

        if details.server_protocol_version == 0 && code == ErrorCode::ServerNotFound {
            warn!(
                "Lighting server not found, retrying handshake in {}s",
                retry_delay.as_secs_f32()
            );
            tokio::time::sleep(retry_delay).await;
            continue;
        }

        if details.breaking_changes {
            return Err(Error::IncompatibleProtocol {
                sdk_version: details.sdk_version,
                server_version: details.server_version,
            });
        }

        if !code.is_success() {
            return Err(Error::Sdk(code));
        }

        break details;
    };

    info!(
        sdk_version = %details.sdk_version,
        server_version = %details.server_version,
        protocol = details.server_protocol_version,
        "Lighting SDK handshake complete"
    );

    if exclusive_control {
        sdk.request_exclusive_control();
        if check_last_error(sdk, "request_exclusive_control") {
            info!("Acquired exclusive lighting control");
        }
    }

    Ok(details)
}

/// Enumerate devices and average each one's LED colours
pub fn enumerate(sdk: &dyn LightingSdk) -> Vec<DeviceSnapshot> {
    let devices = sdk.list_devices();
    check_last_error(sdk, "list_devices");

    devices
        .iter()
        .enumerate()
        .map(|(index, device)| DeviceSnapshot::from_leds(&device.model, index, &device.colors))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<SdkDevice> {
        vec![
            SdkDevice {
                model: "K70".to_string(),
                colors: vec![Rgb::new(10, 0, 0), Rgb::new(0, 0, 20)],
            },
            SdkDevice {
                model: "Hub".to_string(),
                colors: Vec::new(),
            },
        ]
    }

    #[tokio::test]
    async fn test_initialize_retries_until_server_found() {
        let sdk = VirtualSdk::new(devices()).with_unreachable_server(2);
        let mut backend = sdk.clone();

        let details = initialize(&mut backend, false, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(sdk.handshake_count(), 3);
        assert!(details.server_protocol_version > 0);
        assert!(!sdk.has_exclusive_control());
    }

    #[tokio::test]
    async fn test_initialize_rejects_breaking_changes() {
        let mut sdk = VirtualSdk::new(devices()).with_breaking_changes();

        let err = initialize(&mut sdk, true, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IncompatibleProtocol { .. }));
        assert!(!sdk.has_exclusive_control());
    }

    #[tokio::test]
    async fn test_initialize_takes_exclusive_control() {
        let sdk = VirtualSdk::new(devices());
        let mut backend = sdk.clone();
        initialize(&mut backend, true, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(sdk.has_exclusive_control());
    }

    #[test]
    fn test_enumerate_averages_leds() {
        let sdk = VirtualSdk::new(devices());
        let snapshots = enumerate(&sdk);

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0], DeviceSnapshot::new("K70", 0, Rgb::new(5, 0, 10)));
        assert_eq!(snapshots[1], DeviceSnapshot::new("Hub", 1, Rgb::BLACK));
    }

    #[test]
    fn test_check_last_error() {
        let mut sdk = VirtualSdk::new(devices());
        assert!(sdk.set_device_color(0, Rgb::WHITE));
        assert!(check_last_error(&sdk, "set_device_color"));

        assert!(!sdk.set_device_color(7, Rgb::WHITE));
        assert!(!check_last_error(&sdk, "set_device_color"));
    }
}
