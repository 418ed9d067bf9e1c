//! In-memory lighting backend
//!
//! Cloning a [`VirtualSdk`] yields another handle onto the same devices, so a
//! test can hand one clone to the session and inspect the hardware state
//! through another.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{ErrorCode, LightingSdk, ProtocolDetails, SdkDevice};
use crate::config::VirtualDeviceConfig;
use crate::device::Rgb;

const SDK_VERSION: &str = "4.0.0";
const SERVER_VERSION: &str = "virtual";
const PROTOCOL_VERSION: u32 = 16;

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<SdkDevice>,
    last_error: ErrorCode,
    handshakes: usize,
    /// Handshakes still to fail with `ServerNotFound`
    unreachable_for: usize,
    breaking_changes: bool,
    fail_writes: bool,
    exclusive: bool,
    layer_priority: Option<u32>,
    writes: usize,
}

/// Shared in-memory device set implementing [`LightingSdk`]
#[derive(Debug, Clone, Default)]
pub struct VirtualSdk {
    inner: Arc<Mutex<Inner>>,
}

impl VirtualSdk {
    pub fn new(devices: Vec<SdkDevice>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                devices,
                ..Default::default()
            })),
        }
    }

    /// Build the device set from `[[sdk.devices]]` entries
    pub fn from_config(devices: &[VirtualDeviceConfig]) -> Self {
        Self::new(
            devices
                .iter()
                .map(|d| SdkDevice {
                    model: d.model.clone(),
                    colors: vec![Rgb::from(d.color); d.leds],
                })
                .collect(),
        )
    }

    /// Fail the next `attempts` handshakes as if the server were not running
    pub fn with_unreachable_server(self, attempts: usize) -> Self {
        self.inner.lock().unreachable_for = attempts;
        self
    }

    /// Report an incompatible server on handshake
    pub fn with_breaking_changes(self) -> Self {
        self.inner.lock().breaking_changes = true;
        self
    }

    /// Make every colour write fail with `NoControl`
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Change a device's LEDs behind the bridge's back
    pub fn set_external_color(&self, index: usize, color: Rgb) {
        if let Some(device) = self.inner.lock().devices.get_mut(index) {
            device.colors.iter_mut().for_each(|c| *c = color);
        }
    }

    /// Append a device, as if it had just been plugged in
    pub fn attach(&self, device: SdkDevice) {
        self.inner.lock().devices.push(device);
    }

    /// Remove a device, as if it had been unplugged. Later devices move
    /// down one index.
    pub fn detach(&self, index: usize) -> Option<SdkDevice> {
        let mut inner = self.inner.lock();
        (index < inner.devices.len()).then(|| inner.devices.remove(index))
    }

    pub fn device_colors(&self, index: usize) -> Option<Vec<Rgb>> {
        self.inner.lock().devices.get(index).map(|d| d.colors.clone())
    }

    pub fn handshake_count(&self) -> usize {
        self.inner.lock().handshakes
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn has_exclusive_control(&self) -> bool {
        self.inner.lock().exclusive
    }

    pub fn layer_priority(&self) -> Option<u32> {
        self.inner.lock().layer_priority
    }
}

impl LightingSdk for VirtualSdk {
    fn perform_handshake(&mut self) -> ProtocolDetails {
        let mut inner = self.inner.lock();
        inner.handshakes += 1;

        if inner.unreachable_for > 0 {
            inner.unreachable_for -= 1;
            inner.last_error = ErrorCode::ServerNotFound;
            return ProtocolDetails {
                sdk_version: SDK_VERSION.to_string(),
                server_version: String::new(),
                server_protocol_version: 0,
                breaking_changes: false,
            };
        }

        inner.last_error = if inner.breaking_changes {
            ErrorCode::IncompatibleProtocol
        } else {
            ErrorCode::Success
        };
        ProtocolDetails {
            sdk_version: SDK_VERSION.to_string(),
            server_version: SERVER_VERSION.to_string(),
            server_protocol_version: PROTOCOL_VERSION,
            breaking_changes: inner.breaking_changes,
        }
    }

    fn request_exclusive_control(&mut self) -> bool {
        let mut inner = self.inner.lock();
        inner.exclusive = true;
        inner.last_error = ErrorCode::Success;
        true
    }

    fn release_control(&mut self) -> bool {
        let mut inner = self.inner.lock();
        inner.exclusive = false;
        inner.last_error = ErrorCode::Success;
        true
    }

    fn list_devices(&self) -> Vec<SdkDevice> {
        let mut inner = self.inner.lock();
        inner.last_error = ErrorCode::Success;
        inner.devices.clone()
    }

    fn get_device_colors(&self, index: usize) -> Option<Vec<Rgb>> {
        let mut inner = self.inner.lock();
        match inner.devices.get(index).map(|d| d.colors.clone()) {
            Some(colors) => {
                inner.last_error = ErrorCode::Success;
                Some(colors)
            }
            None => {
                inner.last_error = ErrorCode::InvalidArguments;
                None
            }
        }
    }

    fn set_device_color(&mut self, index: usize, color: Rgb) -> bool {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            inner.last_error = ErrorCode::NoControl;
            return false;
        }
        let Some(device) = inner.devices.get_mut(index) else {
            inner.last_error = ErrorCode::InvalidArguments;
            return false;
        };
        device.colors.iter_mut().for_each(|c| *c = color);
        inner.writes += 1;
        inner.last_error = ErrorCode::Success;
        true
    }

    fn set_layer_priority(&mut self, priority: u32) -> bool {
        let mut inner = self.inner.lock();
        inner.layer_priority = Some(priority);
        inner.last_error = ErrorCode::Success;
        true
    }

    fn last_error(&self) -> ErrorCode {
        self.inner.lock().last_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let sdk = VirtualSdk::from_config(&[VirtualDeviceConfig {
            model: "Strip".to_string(),
            leds: 3,
            color: [1, 2, 3],
        }]);
        let devices = sdk.list_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].colors.len(), 3);
        assert_eq!(devices[0].colors[2], Rgb::new(1, 2, 3));
    }

    #[test]
    fn test_clones_share_state() {
        let sdk = VirtualSdk::new(vec![SdkDevice {
            model: "Fan".to_string(),
            colors: vec![Rgb::BLACK; 4],
        }]);
        let mut other = sdk.clone();

        assert!(other.set_device_color(0, Rgb::new(0, 9, 0)));
        assert_eq!(sdk.device_colors(0), Some(vec![Rgb::new(0, 9, 0); 4]));
        assert_eq!(sdk.write_count(), 1);
    }

    #[test]
    fn test_failed_writes_leave_leds_untouched() {
        let mut sdk = VirtualSdk::new(vec![SdkDevice {
            model: "Fan".to_string(),
            colors: vec![Rgb::WHITE],
        }]);
        sdk.set_fail_writes(true);

        assert!(!sdk.set_device_color(0, Rgb::BLACK));
        assert_eq!(sdk.last_error(), ErrorCode::NoControl);
        assert_eq!(sdk.device_colors(0), Some(vec![Rgb::WHITE]));
    }

    #[test]
    fn test_detach_renumbers_devices() {
        let sdk = VirtualSdk::new(vec![
            SdkDevice { model: "Fan".to_string(), colors: vec![Rgb::BLACK] },
            SdkDevice { model: "Strip".to_string(), colors: vec![Rgb::WHITE] },
        ]);

        assert_eq!(sdk.detach(0).map(|d| d.model), Some("Fan".to_string()));
        assert!(sdk.detach(5).is_none());
        let devices = sdk.list_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].model, "Strip");
        assert_eq!(sdk.device_colors(0), Some(vec![Rgb::WHITE]));
    }

    #[test]
    fn test_unknown_index_is_invalid_argument() {
        let sdk = VirtualSdk::default();
        assert!(sdk.get_device_colors(0).is_none());
        assert_eq!(sdk.last_error(), ErrorCode::InvalidArguments);
    }
}
